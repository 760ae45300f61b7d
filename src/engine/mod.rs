//! Boundary to the external SLAM/reconstruction engine.
//!
//! The engine is only ever held by the [`JobRunner`](crate::jobs::JobRunner): long operations
//! run inside a job on the worker context, cheap ones are [`EngineControl`] messages.

mod file_engine;
#[cfg(test)]
pub(crate) mod testing;

pub use file_engine::FileEngine;

use crate::jobs::{CancelToken, JobId, RunnerEvent};
use crate::model::{
    CameraMode, ConfigSnapshot, EngineEvent, ExportParams, OpenResult, PostProcessApproach,
    ProgressEvent, ViewMode,
};
use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Non-blocking commands applied to the engine from the interactive context.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineControl {
    /// Pause (true) or resume (false) map building
    PauseMapping(bool),
    /// Relocalize against a finished map instead of extending it
    LocalizationMode(bool),
    /// Create (or clear) the working database and make it the open one
    ResetWorking {
        path: PathBuf,
        in_memory: bool,
        data_recording: bool,
    },
    CloseDatabase,
    SetViewMode(ViewMode),
    SetCameraMode(CameraMode),
    /// A camera frame reached the engine
    PostFrame,
}

/// Where engine events go. Job-scoped sinks tag every event with the job id.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunnerEvent>,
    job: Option<JobId>,
}

impl EventSink {
    pub(crate) fn live(tx: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        Self { tx, job: None }
    }

    pub(crate) fn for_job(tx: mpsc::UnboundedSender<RunnerEvent>, job: JobId) -> Self {
        Self { tx, job: Some(job) }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(RunnerEvent::Engine {
            job: self.job,
            event,
        });
    }
}

/// Per-job view handed to engine calls: event sink, cancellation flag, and opaque parameters.
#[derive(Debug, Clone)]
pub struct JobContext {
    sink: EventSink,
    cancel: CancelToken,
    parameters: ConfigSnapshot,
}

impl JobContext {
    pub(crate) fn new(sink: EventSink, cancel: CancelToken, parameters: ConfigSnapshot) -> Self {
        Self {
            sink,
            cancel,
            parameters,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn parameters(&self) -> &ConfigSnapshot {
        &self.parameters
    }

    pub fn emit(&self, event: EngineEvent) {
        self.sink.emit(event);
    }

    pub fn progress(&self, count: u32, max: u32) {
        self.emit(EngineEvent::Progress(ProgressEvent { count, max }));
    }

    pub fn init_message(&self, status: i32, text: impl Into<String>) {
        self.emit(EngineEvent::InitMessage {
            status,
            text: text.into(),
        });
    }
}

/// Operations of the reconstruction engine.
///
/// Blocking methods are only called from the worker context, one at a time. Long-running
/// implementations must poll [`JobContext::is_cancelled`] and return early when it is set.
pub trait Engine: Send + Sync {
    /// Receive the sink for events emitted outside of jobs (live stats while mapping).
    fn attach(&self, sink: EventSink);

    fn control(&self, ctrl: EngineControl) -> Result<()>;

    fn open_database(
        &self,
        ctx: &JobContext,
        path: &Path,
        in_memory: bool,
        clear: bool,
    ) -> Result<OpenResult>;

    fn save(&self, ctx: &JobContext, path: &Path) -> Result<()>;

    /// Assemble and write the export artifact(s) into `params.out_dir`.
    fn export_mesh(&self, ctx: &JobContext, params: &ExportParams) -> Result<bool>;

    /// Returns the number of loop closures found, or a negative value on failure.
    fn post_process(&self, ctx: &JobContext, approach: PostProcessApproach) -> Result<i32>;

    fn recover(&self, ctx: &JobContext, from: &Path, to: &Path) -> Result<bool>;

    /// Ask the current blocking call to return early. Advisory only.
    fn cancel_processing(&self);

    /// Forget a cancel request left over from an earlier job. Called before each job starts.
    fn reset_cancel(&self);
}
