//! Scripted engine for tests. Blocking calls can wait on a gate so tests decide when the
//! worker finishes relative to a cancel request.

use super::{Engine, EngineControl, EventSink, JobContext};
use crate::model::{
    now_rfc3339, EngineEvent, ExportKind, ExportParams, OpenResult, Pose, PostProcessApproach,
    StatsEvent,
};
use anyhow::Result;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

/// What the next blocking call reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    Fail,
    /// Return early when cancellation is observed, otherwise succeed.
    HonorCancel,
}

#[derive(Debug)]
pub struct ScriptedEngine {
    gated: bool,
    gate_tx: Mutex<Sender<()>>,
    gate_rx: Mutex<Receiver<()>>,
    script: Mutex<Script>,
    pub open_result: Mutex<OpenResult>,
    pub init_message: Mutex<Option<String>>,
    pub controls: Mutex<Vec<EngineControl>>,
    pub cancel_calls: Mutex<u32>,
    pub reset_calls: Mutex<u32>,
    sink: Mutex<Option<EventSink>>,
}

impl ScriptedEngine {
    pub fn new(gated: bool) -> Self {
        let (tx, rx) = channel();
        Self {
            gated,
            gate_tx: Mutex::new(tx),
            gate_rx: Mutex::new(rx),
            script: Mutex::new(Script::Succeed),
            open_result: Mutex::new(OpenResult::Ready { optimized: None }),
            init_message: Mutex::new(None),
            controls: Mutex::new(Vec::new()),
            cancel_calls: Mutex::new(0),
            reset_calls: Mutex::new(0),
            sink: Mutex::new(None),
        }
    }

    /// Let one gated call finish.
    pub fn release(&self) {
        let _ = self.gate_tx.lock().unwrap().send(());
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn set_open_result(&self, result: OpenResult) {
        *self.open_result.lock().unwrap() = result;
    }

    pub fn last_control(&self) -> Option<EngineControl> {
        self.controls.lock().unwrap().last().cloned()
    }

    /// Push a stats snapshot through the live sink, as the engine does while mapping.
    pub fn push_stats(&self, nodes: u32, loop_closure_id: i32) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.emit(EngineEvent::Stats(Box::new(StatsEvent {
                timestamp_utc: now_rfc3339(),
                nodes,
                words: nodes * 10,
                loop_closure_id,
                database_memory_mb: 1,
                memory_used_mb: 64,
                pose: Pose {
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                    roll: 0.0,
                    pitch: 0.0,
                    yaw: 0.0,
                },
            })));
        }
    }

    fn step(&self, ctx: &JobContext) -> bool {
        ctx.progress(1, 2);
        if self.gated {
            let _ = self.gate_rx.lock().unwrap().recv();
        }
        ctx.progress(2, 2);
        match *self.script.lock().unwrap() {
            Script::Succeed => true,
            Script::Fail => false,
            Script::HonorCancel => !ctx.is_cancelled(),
        }
    }
}

impl Engine for ScriptedEngine {
    fn attach(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn control(&self, ctrl: EngineControl) -> Result<()> {
        if let EngineControl::ResetWorking { path, .. } = &ctrl {
            std::fs::write(path, b"{}")?;
        }
        self.controls.lock().unwrap().push(ctrl);
        Ok(())
    }

    fn open_database(
        &self,
        ctx: &JobContext,
        _path: &Path,
        _in_memory: bool,
        _clear: bool,
    ) -> Result<OpenResult> {
        if let Some(text) = self.init_message.lock().unwrap().clone() {
            ctx.init_message(1, text);
        }
        if !self.step(ctx) {
            anyhow::bail!("open failed");
        }
        Ok(*self.open_result.lock().unwrap())
    }

    fn save(&self, ctx: &JobContext, path: &Path) -> Result<()> {
        if !self.step(ctx) {
            anyhow::bail!("save failed");
        }
        std::fs::write(path, now_rfc3339().as_bytes())?;
        Ok(())
    }

    fn export_mesh(&self, ctx: &JobContext, params: &ExportParams) -> Result<bool> {
        let name = match params.request.kind {
            ExportKind::PointCloud { .. } => "cloud.ply",
            ExportKind::Mesh { .. } => "mesh.ply",
        };
        // Written before the outcome is known so cleanup after cancel is observable.
        std::fs::write(params.out_dir.join(name), b"partial")?;
        Ok(self.step(ctx))
    }

    fn post_process(&self, ctx: &JobContext, _approach: PostProcessApproach) -> Result<i32> {
        Ok(if self.step(ctx) { 2 } else { -1 })
    }

    fn recover(&self, ctx: &JobContext, from: &Path, to: &Path) -> Result<bool> {
        if !self.step(ctx) {
            return Ok(false);
        }
        std::fs::copy(from, to)?;
        Ok(true)
    }

    fn cancel_processing(&self) {
        *self.cancel_calls.lock().unwrap() += 1;
    }

    fn reset_cancel(&self) {
        *self.reset_calls.lock().unwrap() += 1;
    }
}
