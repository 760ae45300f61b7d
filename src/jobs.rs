//! Single-slot runner for long engine operations.
//!
//! At most one job is in flight. Its body runs on the blocking pool, engine events it emits and
//! its resolution travel over the same channel, so every progress event for a job is received
//! before that job's [`JobResolution`].

use crate::engine::{Engine, EngineControl, EventSink, JobContext};
use crate::error::JobError;
use crate::model::{ConfigSnapshot, EngineEvent, ExportParams, OpenResult, PostProcessApproach};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Recover,
    Export,
    Optimize,
    Save,
    Open,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobSpec {
    Recover { from: PathBuf, to: PathBuf },
    Export(ExportParams),
    Optimize { approach: PostProcessApproach },
    Save { path: PathBuf },
    Open { path: PathBuf, in_memory: bool, clear: bool },
}

/// A unit of background work plus the opaque settings forwarded to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub spec: JobSpec,
    pub parameters: ConfigSnapshot,
}

impl Job {
    pub fn new(spec: JobSpec, parameters: ConfigSnapshot) -> Self {
        Self { spec, parameters }
    }

    pub fn kind(&self) -> JobKind {
        match self.spec {
            JobSpec::Recover { .. } => JobKind::Recover,
            JobSpec::Export(_) => JobKind::Export,
            JobSpec::Optimize { .. } => JobKind::Optimize,
            JobSpec::Save { .. } => JobKind::Save,
            JobSpec::Open { .. } => JobKind::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobValue {
    Recovered { to: PathBuf },
    Exported { dir: PathBuf },
    Optimized { loop_closures: u32 },
    Saved { path: PathBuf },
    Opened(OpenResult),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(JobValue),
    Failure(String),
    Cancelled,
}

/// Cooperative cancellation flag shared between the interactive context and the engine call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
    token: CancelToken,
}

impl JobHandle {
    pub fn cancellation_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobResolution {
    pub id: JobId,
    pub kind: JobKind,
    pub outcome: JobOutcome,
}

/// Everything the worker context reports back to the interactive context.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Engine {
        job: Option<JobId>,
        event: EngineEvent,
    },
    Resolved(JobResolution),
}

pub struct JobRunner {
    engine: Arc<dyn Engine>,
    event_tx: UnboundedSender<RunnerEvent>,
    in_flight: Option<JobHandle>,
    next_id: JobId,
}

impl JobRunner {
    /// Take ownership of the engine and return the receiving end of its event stream.
    pub fn new(engine: Arc<dyn Engine>) -> (Self, UnboundedReceiver<RunnerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RunnerEvent>();
        engine.attach(EventSink::live(event_tx.clone()));
        (
            Self {
                engine,
                event_tx,
                in_flight: None,
                next_id: 0,
            },
            event_rx,
        )
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&JobHandle> {
        self.in_flight.as_ref()
    }

    /// Start `job` on the worker context. Fails fast instead of queueing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&mut self, job: Job) -> Result<JobHandle, JobError> {
        if let Some(running) = &self.in_flight {
            return Err(JobError::AlreadyRunning {
                running: running.kind,
            });
        }

        self.next_id += 1;
        let handle = JobHandle {
            id: self.next_id,
            kind: job.kind(),
            token: CancelToken::default(),
        };
        info!(job = handle.id, kind = ?handle.kind, "job submitted");
        self.engine.reset_cancel();

        let ctx = JobContext::new(
            EventSink::for_job(self.event_tx.clone(), handle.id),
            handle.token.clone(),
            job.parameters,
        );
        let engine = self.engine.clone();
        let tx = self.event_tx.clone();
        let (id, kind) = (handle.id, handle.kind);
        let spec = job.spec;

        tokio::spawn(async move {
            let body = tokio::task::spawn_blocking(move || {
                let result = run_body(engine.as_ref(), &spec, &ctx);
                (result, ctx.is_cancelled())
            });
            let outcome = match body.await {
                Ok((result, cancelled)) => settle(result, cancelled),
                Err(e) => JobOutcome::Failure(format!("job worker failed: {e}")),
            };
            info!(job = id, ?kind, ?outcome, "job resolved");
            let _ = tx.send(RunnerEvent::Resolved(JobResolution { id, kind, outcome }));
        });

        self.in_flight = Some(handle.clone());
        Ok(handle)
    }

    /// Request cancellation of `handle`. Returns false if it is not the job in flight
    /// or cancellation was already requested.
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        match &self.in_flight {
            Some(current) if current.id == handle.id && !current.cancellation_requested() => {
                info!(job = handle.id, kind = ?handle.kind, "cancellation requested");
                current.token.cancel();
                self.engine.cancel_processing();
                true
            }
            _ => false,
        }
    }

    /// Release the slot once the resolution for `id` has been consumed.
    pub fn complete(&mut self, id: JobId) -> bool {
        match &self.in_flight {
            Some(current) if current.id == id => {
                self.in_flight = None;
                true
            }
            _ => {
                debug!(job = id, "resolution for a job that is not in flight");
                false
            }
        }
    }

    pub fn control(&self, ctrl: EngineControl) -> Result<()> {
        debug!(?ctrl, "engine control");
        self.engine.control(ctrl)
    }
}

fn run_body(engine: &dyn Engine, spec: &JobSpec, ctx: &JobContext) -> Result<JobValue, String> {
    let describe = |e: anyhow::Error| format!("{e:#}");
    match spec {
        JobSpec::Open {
            path,
            in_memory,
            clear,
        } => engine
            .open_database(ctx, path, *in_memory, *clear)
            .map(JobValue::Opened)
            .map_err(describe),
        JobSpec::Save { path } => engine
            .save(ctx, path)
            .map(|_| JobValue::Saved { path: path.clone() })
            .map_err(describe),
        JobSpec::Export(params) => match engine.export_mesh(ctx, params) {
            Ok(true) => Ok(JobValue::Exported {
                dir: params.out_dir.clone(),
            }),
            Ok(false) => Err("export failed".into()),
            Err(e) => Err(describe(e)),
        },
        JobSpec::Optimize { approach } => match engine.post_process(ctx, *approach) {
            Ok(n) if n >= 0 => Ok(JobValue::Optimized {
                loop_closures: n as u32,
            }),
            Ok(_) => Err("post-processing failed".into()),
            Err(e) => Err(describe(e)),
        },
        JobSpec::Recover { from, to } => match engine.recover(ctx, from, to) {
            Ok(true) => Ok(JobValue::Recovered { to: to.clone() }),
            Ok(false) => Err(format!("could not recover {}", display(from))),
            Err(e) => Err(describe(e)),
        },
    }
}

/// A completed engine call always wins; an early return after a cancel request is `Cancelled`.
fn settle(result: Result<JobValue, String>, cancelled: bool) -> JobOutcome {
    match result {
        Ok(value) => JobOutcome::Success(value),
        Err(_) if cancelled => JobOutcome::Cancelled,
        Err(reason) => JobOutcome::Failure(reason),
    }
}

fn display(p: &Path) -> String {
    p.display().to_string()
}

#[cfg(test)]
mod tests {
    use crate::engine::testing::{Script, ScriptedEngine};
    use super::*;

    async fn next_resolution(rx: &mut UnboundedReceiver<RunnerEvent>) -> (Vec<JobId>, JobResolution) {
        let mut progress_jobs = Vec::new();
        loop {
            match rx.recv().await.expect("runner channel closed") {
                RunnerEvent::Engine { job: Some(id), .. } => progress_jobs.push(id),
                RunnerEvent::Engine { job: None, .. } => {}
                RunnerEvent::Resolved(r) => return (progress_jobs, r),
            }
        }
    }

    fn optimize() -> Job {
        Job::new(
            JobSpec::Optimize {
                approach: PostProcessApproach::Standard,
            },
            ConfigSnapshot::default(),
        )
    }

    #[tokio::test]
    async fn second_submit_fails_fast() {
        let engine = Arc::new(ScriptedEngine::new(true));
        let (mut runner, mut rx) = JobRunner::new(engine.clone());

        let first = runner.submit(optimize()).unwrap();
        assert_eq!(*engine.reset_calls.lock().unwrap(), 1);
        let err = runner.submit(optimize()).unwrap_err();
        assert!(matches!(
            err,
            JobError::AlreadyRunning {
                running: JobKind::Optimize
            }
        ));

        engine.release();
        let (_, resolution) = next_resolution(&mut rx).await;
        assert_eq!(resolution.id, first.id);
        assert!(runner.complete(first.id));
        assert!(runner.submit(optimize()).is_ok());
        engine.release();
    }

    #[tokio::test]
    async fn progress_precedes_resolution() {
        let engine = Arc::new(ScriptedEngine::new(false));
        let (mut runner, mut rx) = JobRunner::new(engine);

        let handle = runner.submit(optimize()).unwrap();
        let (progress, resolution) = next_resolution(&mut rx).await;
        assert_eq!(progress, vec![handle.id, handle.id]);
        assert_eq!(
            resolution.outcome,
            JobOutcome::Success(JobValue::Optimized { loop_closures: 2 })
        );
    }

    #[tokio::test]
    async fn cancel_observed_by_engine_resolves_cancelled() {
        let engine = Arc::new(ScriptedEngine::new(true));
        engine.set_script(Script::HonorCancel);
        let (mut runner, mut rx) = JobRunner::new(engine.clone());

        let handle = runner.submit(optimize()).unwrap();
        assert!(runner.cancel(&handle));
        assert!(!runner.cancel(&handle), "second cancel is a no-op");
        assert!(runner.is_busy(), "cancel does not release the slot");
        engine.release();

        let (_, resolution) = next_resolution(&mut rx).await;
        assert_eq!(resolution.outcome, JobOutcome::Cancelled);
        assert_eq!(*engine.cancel_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_engine_cancel_is_cleared_on_submit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(crate::engine::FileEngine::new(std::time::Duration::ZERO));
        engine
            .control(EngineControl::ResetWorking {
                path: dir.path().join("w.db"),
                in_memory: false,
                data_recording: false,
            })
            .unwrap();
        engine.control(EngineControl::PauseMapping(false)).unwrap();
        engine.control(EngineControl::PostFrame).unwrap();
        // Left behind by a job that finished before the engine saw it.
        engine.cancel_processing();

        let (mut runner, mut rx) = JobRunner::new(engine);
        runner.submit(optimize()).unwrap();
        let (_, resolution) = next_resolution(&mut rx).await;
        assert_eq!(
            resolution.outcome,
            JobOutcome::Success(JobValue::Optimized { loop_closures: 0 })
        );
    }

    #[tokio::test]
    async fn completion_wins_over_late_cancel() {
        let engine = Arc::new(ScriptedEngine::new(true));
        engine.set_script(Script::Succeed);
        let (mut runner, mut rx) = JobRunner::new(engine.clone());

        let handle = runner.submit(optimize()).unwrap();
        runner.cancel(&handle);
        engine.release();

        let (_, resolution) = next_resolution(&mut rx).await;
        assert!(matches!(resolution.outcome, JobOutcome::Success(_)));
    }

    #[tokio::test]
    async fn failure_without_cancel_is_failure() {
        let engine = Arc::new(ScriptedEngine::new(false));
        engine.set_script(Script::Fail);
        let (mut runner, mut rx) = JobRunner::new(engine);

        runner.submit(optimize()).unwrap();
        let (_, resolution) = next_resolution(&mut rx).await;
        assert_eq!(
            resolution.outcome,
            JobOutcome::Failure("post-processing failed".into())
        );
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let engine = Arc::new(ScriptedEngine::new(false));
        let (mut runner, _rx) = JobRunner::new(engine);
        assert!(!runner.complete(42));
    }
}
