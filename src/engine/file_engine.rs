//! File-backed stand-in for the reconstruction engine.
//!
//! Databases are small JSON documents. Long operations advance in steps, emit progress, and
//! return early once cancellation is requested, which is enough to drive the whole session
//! workflow end to end without the real SLAM library.

use super::{Engine, EngineControl, EventSink, JobContext};
use crate::model::{
    now_rfc3339, CameraMode, EngineEvent, ExportKind, ExportParams, OpenResult, Pose,
    PostProcessApproach, StatsEvent, ViewMode,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};
use std::time::Duration;
use tracing::{debug, warn};

const STEPS: u32 = 10;
/// Every Nth node closes a loop.
const LOOP_CLOSURE_PERIOD: u32 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MapDocument {
    nodes: u32,
    words: u32,
    loop_closures: u32,
    #[serde(default)]
    optimized: Option<ViewMode>,
    #[serde(default = "default_true")]
    graph_ok: bool,
    #[serde(default)]
    data_recording: bool,
    #[serde(default)]
    last_pose: Option<Pose>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default)]
struct Loaded {
    doc: MapDocument,
    path: Option<PathBuf>,
    in_memory: bool,
}

#[derive(Debug, Default)]
struct Flags {
    paused: bool,
    localization: bool,
    view_mode: ViewMode,
    camera_mode: CameraMode,
}

#[derive(Debug)]
pub struct FileEngine {
    step_delay: Duration,
    max_load_bytes: Option<u64>,
    loaded: Mutex<Option<Loaded>>,
    flags: Mutex<Flags>,
    cancel: AtomicBool,
    sink: Mutex<Option<EventSink>>,
}

impl FileEngine {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            max_load_bytes: None,
            loaded: Mutex::new(None),
            flags: Mutex::new(Flags {
                paused: true,
                ..Flags::default()
            }),
            cancel: AtomicBool::new(false),
            sink: Mutex::new(None),
        }
    }

    /// Databases larger than this fail to open with [`OpenResult::OutOfMemory`].
    pub fn with_max_load_bytes(mut self, limit: u64) -> Self {
        self.max_load_bytes = Some(limit);
        self
    }

    fn lock_loaded(&self) -> std::sync::MutexGuard<'_, Option<Loaded>> {
        self.loaded.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_flags(&self) -> std::sync::MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit_live(&self, event: EngineEvent) {
        if let Some(sink) = self.sink.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            sink.emit(event);
        }
    }

    fn cancelled(&self, ctx: &JobContext) -> bool {
        ctx.is_cancelled() || self.cancel.load(Ordering::Relaxed)
    }

    /// Run `STEPS` progress steps; false if cancellation was observed.
    fn run_steps(&self, ctx: &JobContext) -> bool {
        for i in 1..=STEPS {
            if self.cancelled(ctx) {
                debug!(step = i, "engine observed cancellation");
                return false;
            }
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
            ctx.progress(i, STEPS);
        }
        !self.cancelled(ctx)
    }

    fn persist(loaded: &Loaded) -> Result<()> {
        if loaded.in_memory {
            return Ok(());
        }
        if let Some(path) = &loaded.path {
            write_doc(path, &loaded.doc)?;
        }
        Ok(())
    }

    fn post_frame(&self) -> Result<()> {
        if self.lock_flags().paused {
            return Ok(());
        }
        let stats = {
            let mut guard = self.lock_loaded();
            let Some(loaded) = guard.as_mut() else {
                return Ok(());
            };
            let doc = &mut loaded.doc;
            doc.nodes += 1;
            doc.words += 37;
            let loop_closure_id = if doc.nodes > LOOP_CLOSURE_PERIOD
                && doc.nodes % LOOP_CLOSURE_PERIOD == 0
                && !doc.data_recording
            {
                doc.loop_closures += 1;
                (doc.nodes - LOOP_CLOSURE_PERIOD) as i32
            } else {
                0
            };
            doc.last_pose = Some(Pose {
                x: doc.nodes as f32 * 0.05,
                y: 0.0,
                z: 0.0,
                roll: 0.0,
                pitch: 0.0,
                yaw: 0.0,
            });
            let stats = snapshot(doc, loop_closure_id);
            Self::persist(loaded)?;
            stats
        };
        self.emit_live(EngineEvent::Stats(Box::new(stats)));
        Ok(())
    }
}

fn snapshot(doc: &MapDocument, loop_closure_id: i32) -> StatsEvent {
    StatsEvent {
        timestamp_utc: now_rfc3339(),
        nodes: doc.nodes,
        words: doc.words,
        loop_closure_id,
        database_memory_mb: doc.words / 1024,
        memory_used_mb: 64 + u64::from(doc.nodes) / 4,
        pose: doc.last_pose.unwrap_or(Pose {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        }),
    }
}

fn write_doc(path: &Path, doc: &MapDocument) -> Result<()> {
    let json = serde_json::to_vec_pretty(doc)?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))
}

fn read_doc(path: &Path) -> Result<MapDocument> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn optimized_message(mode: ViewMode) -> &'static str {
    match mode {
        ViewMode::Cloud => "Loading optimized cloud...done.",
        ViewMode::Mesh => "Loading optimized mesh...done.",
        ViewMode::TexturedMesh => "Loading optimized texture mesh...done.",
    }
}

impl Engine for FileEngine {
    fn attach(&self, sink: EventSink) {
        *self.sink.lock().unwrap_or_else(|p| p.into_inner()) = Some(sink);
    }

    fn control(&self, ctrl: EngineControl) -> Result<()> {
        if ctrl != EngineControl::PostFrame {
            debug!(?ctrl, "engine control");
        }
        match ctrl {
            EngineControl::PauseMapping(p) => self.lock_flags().paused = p,
            EngineControl::LocalizationMode(on) => self.lock_flags().localization = on,
            EngineControl::SetViewMode(mode) => self.lock_flags().view_mode = mode,
            EngineControl::SetCameraMode(mode) => self.lock_flags().camera_mode = mode,
            EngineControl::ResetWorking {
                path,
                in_memory,
                data_recording,
            } => {
                let doc = MapDocument {
                    graph_ok: true,
                    data_recording,
                    ..MapDocument::default()
                };
                // The working file exists even in memory mode so a crash leaves a trace.
                write_doc(&path, &doc)?;
                *self.lock_loaded() = Some(Loaded {
                    doc,
                    path: Some(path),
                    in_memory,
                });
            }
            EngineControl::CloseDatabase => {
                *self.lock_loaded() = None;
            }
            EngineControl::PostFrame => self.post_frame()?,
        }
        Ok(())
    }

    fn open_database(
        &self,
        ctx: &JobContext,
        path: &Path,
        in_memory: bool,
        clear: bool,
    ) -> Result<OpenResult> {
        if clear {
            let doc = MapDocument {
                graph_ok: true,
                ..MapDocument::default()
            };
            write_doc(path, &doc)?;
        }
        let size = std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        if self.max_load_bytes.is_some_and(|limit| size > limit) {
            warn!(size, "database too large to load");
            return Ok(OpenResult::OutOfMemory);
        }
        let doc = read_doc(path)?;
        if let Some(mode) = doc.optimized {
            ctx.init_message(1, optimized_message(mode));
        }
        if !self.run_steps(ctx) {
            anyhow::bail!("loading {} interrupted", path.display());
        }
        if !doc.graph_ok {
            return Ok(OpenResult::OptimizationFailed);
        }
        let optimized = doc.optimized;
        ctx.emit(EngineEvent::Stats(Box::new(snapshot(&doc, 0))));
        *self.lock_loaded() = Some(Loaded {
            doc,
            path: Some(path.to_path_buf()),
            in_memory,
        });
        Ok(OpenResult::Ready { optimized })
    }

    fn save(&self, ctx: &JobContext, path: &Path) -> Result<()> {
        if !self.run_steps(ctx) {
            anyhow::bail!("save interrupted");
        }
        let mut guard = self.lock_loaded();
        let loaded = guard.as_mut().context("no database is open")?;
        write_doc(path, &loaded.doc)?;
        loaded.path = Some(path.to_path_buf());
        loaded.in_memory = false;
        Ok(())
    }

    fn export_mesh(&self, ctx: &JobContext, params: &ExportParams) -> Result<bool> {
        let doc = match self.lock_loaded().as_ref() {
            Some(l) if l.doc.nodes > 0 => l.doc.clone(),
            _ => return Ok(false),
        };
        if !self.run_steps(ctx) {
            return Ok(false);
        }
        let name = match params.request.kind {
            ExportKind::PointCloud { .. } => "cloud.ply",
            ExportKind::Mesh { textured: false } => "mesh.ply",
            ExportKind::Mesh { textured: true } => "mesh.obj",
        };
        let artifact = serde_json::json!({
            "nodes": doc.nodes,
            "request": params.request,
            "parameters": ctx.parameters(),
        });
        std::fs::create_dir_all(&params.out_dir)?;
        std::fs::write(
            params.out_dir.join(name),
            serde_json::to_vec_pretty(&artifact)?,
        )?;

        let mut guard = self.lock_loaded();
        if let Some(loaded) = guard.as_mut() {
            if params.request.optimized || params.request.meshing() {
                loaded.doc.optimized = Some(params.request.view_mode());
                Self::persist(loaded)?;
            }
        }
        Ok(true)
    }

    fn post_process(&self, ctx: &JobContext, approach: PostProcessApproach) -> Result<i32> {
        let nodes = self.lock_loaded().as_ref().map(|l| l.doc.nodes).unwrap_or(0);
        if nodes == 0 {
            return Ok(-1);
        }
        debug!(approach = approach.code(), nodes, "post-processing");
        if !self.run_steps(ctx) {
            return Ok(-1);
        }
        let mut guard = self.lock_loaded();
        let Some(loaded) = guard.as_mut() else {
            return Ok(-1);
        };
        if approach == PostProcessApproach::DetectMoreLoopClosures {
            loaded.doc.loop_closures += 1;
        }
        loaded.doc.graph_ok = true;
        Self::persist(loaded)?;
        Ok(loaded.doc.loop_closures as i32)
    }

    fn recover(&self, ctx: &JobContext, from: &Path, to: &Path) -> Result<bool> {
        let doc = match read_doc(from) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("unrecoverable database: {e:#}");
                return Ok(false);
            }
        };
        if !self.run_steps(ctx) {
            return Ok(false);
        }
        write_doc(to, &doc)?;
        Ok(true)
    }

    fn cancel_processing(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{CancelToken, RunnerEvent};
    use crate::model::{ConfigSnapshot, ExportRequest};
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn ctx() -> (JobContext, CancelToken, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancelToken::default();
        let ctx = JobContext::new(
            EventSink::for_job(tx, 1),
            token.clone(),
            ConfigSnapshot::default(),
        );
        (ctx, token, rx)
    }

    fn map_with_nodes(engine: &FileEngine, path: &Path, frames: u32) {
        engine
            .control(EngineControl::ResetWorking {
                path: path.to_path_buf(),
                in_memory: false,
                data_recording: false,
            })
            .unwrap();
        engine.control(EngineControl::PauseMapping(false)).unwrap();
        for _ in 0..frames {
            engine.control(EngineControl::PostFrame).unwrap();
        }
        engine.control(EngineControl::PauseMapping(true)).unwrap();
    }

    #[test]
    fn frames_are_ignored_while_paused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.db");
        let engine = FileEngine::new(Duration::ZERO);
        engine
            .control(EngineControl::ResetWorking {
                path: path.clone(),
                in_memory: false,
                data_recording: false,
            })
            .unwrap();
        engine.control(EngineControl::PostFrame).unwrap();
        assert_eq!(read_doc(&path).unwrap().nodes, 0);
    }

    #[test]
    fn live_frames_emit_stats_and_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.db");
        let engine = FileEngine::new(Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.attach(EventSink::live(tx));

        map_with_nodes(&engine, &path, 20);

        let doc = read_doc(&path).unwrap();
        assert_eq!(doc.nodes, 20);
        assert_eq!(doc.loop_closures, 1);
        let mut last = None;
        while let Ok(RunnerEvent::Engine { job, event }) = rx.try_recv() {
            assert_eq!(job, None);
            last = Some(event);
        }
        assert!(matches!(last, Some(EngineEvent::Stats(s)) if s.nodes == 20 && s.loop_closure_id == 10));
    }

    #[test]
    fn post_process_reports_loop_closures() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.db");
        let engine = FileEngine::new(Duration::ZERO);
        map_with_nodes(&engine, &path, 30);

        let (ctx, _, _rx) = ctx();
        assert_eq!(
            engine
                .post_process(&ctx, PostProcessApproach::Standard)
                .unwrap(),
            2
        );
    }

    #[test]
    fn post_process_on_empty_map_fails() {
        let engine = FileEngine::new(Duration::ZERO);
        let (ctx, _, _rx) = ctx();
        assert_eq!(
            engine
                .post_process(&ctx, PostProcessApproach::Standard)
                .unwrap(),
            -1
        );
    }

    #[test]
    fn cancelled_export_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.db");
        let out_dir = dir.path().join("Export");
        std::fs::create_dir_all(&out_dir).unwrap();
        let engine = FileEngine::new(Duration::ZERO);
        map_with_nodes(&engine, &path, 3);

        let (ctx, token, _rx) = ctx();
        token.cancel();
        let params = ExportParams {
            request: ExportRequest::standard_mesh(),
            out_dir: out_dir.clone(),
        };
        assert!(!engine.export_mesh(&ctx, &params).unwrap());
        assert_eq!(std::fs::read_dir(&out_dir).unwrap().count(), 0);
    }

    #[test]
    fn engine_cancel_holds_until_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.db");
        let engine = FileEngine::new(Duration::ZERO);
        map_with_nodes(&engine, &path, 3);

        // A cancel that lands before the body runs is still observed.
        engine.cancel_processing();
        let (ctx, _, _rx) = ctx();
        assert_eq!(
            engine
                .post_process(&ctx, PostProcessApproach::Standard)
                .unwrap(),
            -1
        );

        engine.reset_cancel();
        let (ctx, _, _rx) = self::ctx();
        assert_eq!(
            engine
                .post_process(&ctx, PostProcessApproach::Standard)
                .unwrap(),
            0
        );
    }

    #[test]
    fn export_marks_database_optimized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.db");
        let out_dir = dir.path().join("Export");
        let engine = FileEngine::new(Duration::ZERO);
        map_with_nodes(&engine, &path, 3);

        let (ctx, _, _rx) = ctx();
        let params = ExportParams {
            request: ExportRequest::standard_mesh(),
            out_dir: out_dir.clone(),
        };
        assert!(engine.export_mesh(&ctx, &params).unwrap());
        assert!(out_dir.join("mesh.ply").exists());
        assert_eq!(read_doc(&path).unwrap().optimized, Some(ViewMode::Mesh));
    }

    #[test]
    fn open_announces_optimized_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.db");
        write_doc(
            &path,
            &MapDocument {
                nodes: 4,
                optimized: Some(ViewMode::TexturedMesh),
                graph_ok: true,
                ..MapDocument::default()
            },
        )
        .unwrap();
        let engine = FileEngine::new(Duration::ZERO);
        let (ctx, _, mut rx) = ctx();

        let result = engine.open_database(&ctx, &path, true, false).unwrap();
        assert_eq!(
            result,
            OpenResult::Ready {
                optimized: Some(ViewMode::TexturedMesh)
            }
        );
        match rx.try_recv().unwrap() {
            RunnerEvent::Engine {
                event: EngineEvent::InitMessage { text, .. },
                ..
            } => assert_eq!(text, "Loading optimized texture mesh...done."),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn open_reports_broken_graph_and_memory_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.db");
        write_doc(
            &path,
            &MapDocument {
                nodes: 4,
                graph_ok: false,
                ..MapDocument::default()
            },
        )
        .unwrap();
        let (ctx, _, _rx) = ctx();

        let engine = FileEngine::new(Duration::ZERO);
        assert_eq!(
            engine.open_database(&ctx, &path, true, false).unwrap(),
            OpenResult::OptimizationFailed
        );

        let engine = FileEngine::new(Duration::ZERO).with_max_load_bytes(8);
        assert_eq!(
            engine.open_database(&ctx, &path, true, false).unwrap(),
            OpenResult::OutOfMemory
        );
    }

    #[test]
    fn recover_rejects_garbage() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("tmp.db");
        let to = dir.path().join("out.db");
        std::fs::write(&from, vec![0u8; 64]).unwrap();
        let engine = FileEngine::new(Duration::ZERO);
        let (ctx, _, _rx) = ctx();

        assert!(!engine.recover(&ctx, &from, &to).unwrap());
        assert!(!to.exists());
    }
}
