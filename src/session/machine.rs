use super::{Session, State};
use crate::config::Settings;
use crate::engine::{Engine, EngineControl};
use crate::error::{JobError, SessionError, SessionResult};
use crate::jobs::{
    Job, JobHandle, JobOutcome, JobResolution, JobRunner, JobSpec, JobValue, RunnerEvent,
};
use crate::model::{
    CameraMode, EngineEvent, ExportParams, ExportRequest, Notice, OpenResult,
    PostProcessApproach, ViewMode,
};
use crate::platform::{CameraPermission, Platform};
use crate::storage::{local_now, DatabaseHandle, DatabaseManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

const MSG_GRAPH_FAILED: &str = "Failed to optimize the graph, unable to display the map.";
const MSG_OUT_OF_MEMORY: &str =
    "Not enough memory. Lower the point cloud density in the settings and try again.";
const MSG_LOADED: &str = "Data has been loaded.";

/// How "stop" leaves the camera states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Stop and optimize the map.
    #[default]
    Optimize,
    /// Stop without post-processing; the working database is kept.
    Suspend,
    /// Throw the scan away.
    Discard,
}

/// Answer to the "previous session was not saved" prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanChoice {
    Recover,
    Ignore,
    Defer,
}

/// What to do when the job in flight resolves.
#[derive(Debug, Clone)]
enum Purpose {
    Recover,
    Export { request: ExportRequest },
    Optimize { then_export: Option<ExportRequest> },
    Save { path: PathBuf },
    Open { path: PathBuf },
}

impl Purpose {
    fn failure_message(&self) -> &'static str {
        match self {
            Purpose::Recover => "Recovery failed.",
            Purpose::Export { .. } => "Exporting map failed.",
            Purpose::Optimize { .. } => "Optimization failed.",
            Purpose::Save { .. } => "Saving database failed.",
            Purpose::Open { .. } => "Loading database failed.",
        }
    }

    fn cancel_message(&self) -> &'static str {
        match self {
            Purpose::Recover => "Recovery canceled",
            Purpose::Export { .. } => "Export canceled",
            Purpose::Optimize { .. } => "Optimization canceled",
            Purpose::Save { .. } => "Save canceled",
            Purpose::Open { .. } => "Loading canceled",
        }
    }
}

/// A crash remnant waiting for the user, and the scan that was asked for.
#[derive(Debug)]
struct PendingOrphan {
    handle: DatabaseHandle,
    data_recording: bool,
    /// State the prompt was raised from; the answer is only accepted there.
    from: State,
}

#[derive(Debug)]
struct ActiveJob {
    handle: JobHandle,
    purpose: Purpose,
}

/// Owns the [`Session`] and is the only code that changes it.
pub struct SessionMachine<P: Platform> {
    session: Session,
    runner: JobRunner,
    storage: DatabaseManager,
    platform: P,
    settings: Settings,
    notices: UnboundedSender<Notice>,
    active: Option<ActiveJob>,
    pending_orphan: Option<PendingOrphan>,
}

impl<P: Platform> SessionMachine<P> {
    /// Build the machine around `engine`. The returned receiver carries engine events and job
    /// resolutions; feed each one to [`Self::handle_runner_event`].
    pub fn new(
        engine: Arc<dyn Engine>,
        platform: P,
        storage: DatabaseManager,
        settings: Settings,
        notices: UnboundedSender<Notice>,
    ) -> (Self, UnboundedReceiver<RunnerEvent>) {
        let (runner, events) = JobRunner::new(engine);
        let mut machine = Self {
            session: Session::default(),
            runner,
            storage,
            platform,
            settings,
            notices,
            active: None,
            pending_orphan: None,
        };
        machine.apply_subsystems(State::Welcome);
        (machine, events)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> State {
        self.session.state
    }

    pub fn storage(&self) -> &DatabaseManager {
        &self.storage
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn job_in_flight(&self) -> Option<&JobHandle> {
        self.active.as_ref().map(|a| &a.handle)
    }

    pub fn pending_orphan(&self) -> Option<&DatabaseHandle> {
        self.pending_orphan.as_ref().map(|p| &p.handle)
    }

    /// Start a fresh scan, after offering to recover an unsaved previous one.
    pub fn new_scan(&mut self, data_recording: bool) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require(&[State::Welcome, State::Idle, State::Visualizing], "start a new scan")?;
        // The working database this process created is the live scan, not a remnant.
        let claimed = self.storage.working().is_some();
        if let Some(orphan) = self.storage.detect_orphan(claimed) {
            info!(path = %orphan.path.display(), size = orphan.size_bytes, "unsaved session found");
            self.notify(Notice::OrphanDetected {
                path: orphan.path.clone(),
                size_bytes: orphan.size_bytes,
            });
            self.pending_orphan = Some(PendingOrphan {
                handle: orphan,
                data_recording,
                from: self.session.state,
            });
            return Ok(());
        }
        self.start_session(data_recording)
    }

    pub fn resolve_orphan(&mut self, choice: OrphanChoice) -> SessionResult<()> {
        let Some(pending) = self.pending_orphan.take() else {
            return Err(self.invalid("resolve a recovery prompt"));
        };
        if pending.from != self.session.state {
            self.pending_orphan = Some(pending);
            return Err(self.invalid("resolve a recovery prompt"));
        }
        match choice {
            OrphanChoice::Defer => {
                debug!(path = %pending.handle.path.display(), "recovery deferred");
                Ok(())
            }
            OrphanChoice::Ignore => {
                self.runner.control(EngineControl::CloseDatabase)?;
                self.storage.discard_working()?;
                self.start_session(pending.data_recording)
            }
            OrphanChoice::Recover => {
                if let Err(e) = self.require_no_job().and_then(|_| self.require_can_process()) {
                    self.pending_orphan = Some(pending);
                    return Err(e);
                }
                self.runner.control(EngineControl::CloseDatabase)?;
                let from = pending.handle.path;
                let to = self.storage.prepare_recovery_target()?;
                self.session.opened_database_path = None;
                self.submit(JobSpec::Recover { from, to }, Purpose::Recover)
            }
        }
    }

    /// Turn the camera back on, creating a working database when none exists.
    pub fn start_camera(&mut self) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require(&[State::Welcome, State::Idle, State::Visualizing], "start the camera")?;
        if self.storage.working().is_none() {
            // A fresh session goes through the remnant check like any new scan.
            return self.new_scan(self.session.data_recording);
        }
        self.ensure_camera_permission()?;
        self.session.camera_mode = CameraMode::FirstPerson;
        self.runner
            .control(EngineControl::SetCameraMode(CameraMode::FirstPerson))?;
        self.transition(State::CameraPreview)
    }

    pub fn record(&mut self) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require_no_job()?;
        self.require(&[State::CameraPreview], "record")?;
        if self.storage.working().is_none() {
            return Err(SessionError::NoWorkingDatabase);
        }
        self.transition(State::Mapping)
    }

    pub fn stop(&mut self, mode: StopMode) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require(
            &[
                State::CameraPreview,
                State::Mapping,
                State::VisualizingWithCamera,
            ],
            "stop",
        )?;

        if mode == StopMode::Discard {
            self.runner.control(EngineControl::CloseDatabase)?;
            self.storage.discard_working()?;
            self.session.reset_map(false);
            return self.transition(State::Welcome);
        }

        if self.session.state == State::VisualizingWithCamera {
            // Relocalization never changes the map.
            self.session.camera_mode = CameraMode::ThirdPerson;
            self.runner
                .control(EngineControl::SetCameraMode(CameraMode::ThirdPerson))?;
            return self.transition(State::Visualizing);
        }

        self.storage.refresh_working();
        if self.session.map_node_count == 0 {
            return self.transition(State::Welcome);
        }
        self.session.camera_mode = CameraMode::ThirdPerson;
        self.runner
            .control(EngineControl::SetCameraMode(CameraMode::ThirdPerson))?;
        self.transition(State::Idle)?;

        if mode == StopMode::Suspend || self.session.data_recording {
            return Ok(());
        }
        let lidar = self.settings.lidar_mode && self.platform.depth_supported();
        let then_export = lidar.then(ExportRequest::standard_mesh);
        self.submit(
            JobSpec::Optimize {
                approach: PostProcessApproach::Standard,
            },
            Purpose::Optimize { then_export },
        )
    }

    pub fn optimize(&mut self, approach: PostProcessApproach) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require_no_job()?;
        self.require(&[State::Idle, State::Visualizing], "optimize")?;
        self.require_map()?;
        self.submit(
            JobSpec::Optimize { approach },
            Purpose::Optimize { then_export: None },
        )
    }

    pub fn export(&mut self, request: ExportRequest) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require_no_job()?;
        self.require(&[State::Idle, State::Visualizing], "export")?;
        self.require_map()?;
        let out_dir = self.storage.reset_export_dir()?;
        self.submit(
            JobSpec::Export(ExportParams { request, out_dir }),
            Purpose::Export { request },
        )
    }

    /// Save the open map under `name`. An existing database is only replaced with `overwrite`.
    pub fn save(&mut self, name: &str, overwrite: bool) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require_no_job()?;
        self.require(&[State::Idle, State::Visualizing], "save")?;
        if self.storage.working().is_none() && self.session.opened_database_path.is_none() {
            return Err(SessionError::NoWorkingDatabase);
        }
        let path = match self.storage.check_save_target(name, overwrite) {
            Ok(path) => path,
            Err(SessionError::SaveCollision { path }) => {
                self.notify(Notice::SaveCollision { path: path.clone() });
                return Err(SessionError::SaveCollision { path });
            }
            Err(e) => return Err(e),
        };
        self.submit(JobSpec::Save { path: path.clone() }, Purpose::Save { path })
    }

    pub fn open(&mut self, name: &str) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require_no_job()?;
        self.require(&[State::Welcome, State::Idle, State::Visualizing], "open a database")?;
        let path = self.storage.saved_path(name)?;
        if !path.is_file() {
            return Err(SessionError::NotFound { path });
        }
        self.submit(
            JobSpec::Open {
                path: path.clone(),
                in_memory: self.settings.database_in_memory,
                clear: false,
            },
            Purpose::Open { path },
        )
    }

    pub fn close_visualization(&mut self) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require(&[State::Visualizing, State::Edit], "close the visualization")?;
        self.session.crop_active = false;
        self.transition(State::Idle)
    }

    pub fn measure(&mut self) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require(&[State::Visualizing], "measure")?;
        self.require_map()?;
        self.transition(State::Edit)
    }

    /// Leave measurement mode, dropping any crop selection.
    pub fn done_measuring(&mut self) -> SessionResult<()> {
        self.require_no_prompt()?;
        self.require(&[State::Edit], "finish measuring")?;
        self.session.crop_active = false;
        self.transition(State::Visualizing)
    }

    pub fn toggle_crop(&mut self) -> SessionResult<bool> {
        self.require(&[State::Edit], "crop")?;
        self.session.crop_active = !self.session.crop_active;
        Ok(self.session.crop_active)
    }

    pub fn set_view_mode(&mut self, mode: ViewMode) -> SessionResult<()> {
        if matches!(self.session.state, State::Processing | State::Welcome) {
            return Err(self.invalid("change the view mode"));
        }
        self.runner.control(EngineControl::SetViewMode(mode))?;
        self.session.view_mode = mode;
        Ok(())
    }

    /// First person needs the live camera; picking it while visualizing relocalizes against
    /// the finished map.
    pub fn set_camera_mode(&mut self, mode: CameraMode) -> SessionResult<()> {
        self.require_no_prompt()?;
        let state = self.session.state;
        match (state, mode) {
            (State::Visualizing, CameraMode::FirstPerson) => {
                self.ensure_camera_permission()?;
                self.apply_camera_mode(mode)?;
                self.transition(State::VisualizingWithCamera)
            }
            (State::VisualizingWithCamera, m) if m != CameraMode::FirstPerson => {
                self.apply_camera_mode(mode)?;
                self.transition(State::Visualizing)
            }
            (State::CameraPreview | State::Mapping | State::VisualizingWithCamera, _) => {
                self.apply_camera_mode(mode)
            }
            (State::Processing | State::Welcome, _) | (_, CameraMode::FirstPerson) => {
                Err(self.invalid("change the camera mode"))
            }
            _ => self.apply_camera_mode(mode),
        }
    }

    /// Request cancellation of the job in flight. Returns false when it was already requested.
    pub fn cancel_job(&mut self) -> SessionResult<bool> {
        self.require(&[State::Processing], "cancel")?;
        let Some(active) = &self.active else {
            return Err(self.invalid("cancel"));
        };
        Ok(self.runner.cancel(&active.handle))
    }

    pub fn app_backgrounded(&mut self) -> SessionResult<()> {
        if self.session.state.camera_live() {
            self.stop(StopMode::Suspend)
        } else {
            Ok(())
        }
    }

    /// Feed a camera frame to the engine while the camera is live.
    pub fn post_frame(&mut self) -> SessionResult<()> {
        if self.session.state.camera_live() {
            self.runner.control(EngineControl::PostFrame)?;
        }
        Ok(())
    }

    /// Render-loop status codes from the 3-D view. Never changes state.
    pub fn on_render_status(&mut self, code: i32) {
        let msg = match code {
            -1 => "Out of Memory.",
            -2 => "Rendering Error.",
            _ => return,
        };
        warn!(code, "render error");
        self.status(msg);
    }

    pub fn list_databases(&mut self) -> SessionResult<Vec<DatabaseHandle>> {
        let list = self.storage.list_saved()?;
        self.notify(Notice::Databases(list.iter().map(|h| h.name()).collect()));
        Ok(list)
    }

    pub fn rename_database(
        &mut self,
        from: &str,
        to: &str,
        overwrite: bool,
    ) -> SessionResult<PathBuf> {
        self.storage
            .rename_saved(from, to, overwrite, &self.databases_in_use())
    }

    pub fn delete_database(&mut self, name: &str) -> SessionResult<PathBuf> {
        self.storage.delete_saved(name, &self.databases_in_use())
    }

    /// Apply an engine event or a job resolution on the interactive context.
    pub fn handle_runner_event(&mut self, event: RunnerEvent) -> SessionResult<()> {
        match event {
            RunnerEvent::Engine { job: Some(id), .. }
                if self.active.as_ref().map(|a| a.handle.id) != Some(id) =>
            {
                debug!(job = id, "ignoring event from a resolved job");
                Ok(())
            }
            RunnerEvent::Engine { job, event } => self.on_engine_event(job, event),
            RunnerEvent::Resolved(resolution) => self.on_resolved(resolution),
        }
    }

    fn on_engine_event(&mut self, job: Option<u64>, event: EngineEvent) -> SessionResult<()> {
        match event {
            EngineEvent::Progress(p) => {
                let Some(job) = job else {
                    return Ok(());
                };
                let fraction = p.fraction();
                self.session.progress = Some(fraction);
                self.notify(Notice::Progress { job, fraction });
            }
            EngineEvent::Stats(stats) => {
                self.session.map_node_count = stats.nodes;
                if stats.loop_closure_id > 0 {
                    self.session.loop_closures += 1;
                }
                self.session.last_stats = Some(*stats);
            }
            EngineEvent::InitMessage { status, text } => {
                let optimized = match text.as_str() {
                    "Loading optimized cloud...done." => Some(ViewMode::Cloud),
                    "Loading optimized mesh...done." => Some(ViewMode::Mesh),
                    "Loading optimized texture mesh...done." => Some(ViewMode::TexturedMesh),
                    _ => None,
                };
                let loading = matches!(
                    self.active.as_ref().map(|a| &a.purpose),
                    Some(Purpose::Open { .. })
                );
                match optimized {
                    Some(mode) if loading && self.session.state == State::Processing => {
                        info!(?mode, "optimized map found while loading");
                        self.session.view_mode = mode;
                        self.session.camera_mode = CameraMode::Top;
                        self.transition(State::VisualizingWhileLoading)?;
                    }
                    _ => debug!(status, %text, "engine init"),
                }
            }
        }
        Ok(())
    }

    fn on_resolved(&mut self, resolution: JobResolution) -> SessionResult<()> {
        let JobResolution { id, kind, outcome } = resolution;
        let purpose = match self.active.take() {
            Some(active) if active.handle.id == id => active.purpose,
            other => {
                debug!(job = id, ?kind, "resolution for a job that is not in flight");
                self.active = other;
                return Ok(());
            }
        };
        self.runner.complete(id);
        self.session.progress = None;

        let value = match outcome {
            JobOutcome::Success(value) => value,
            JobOutcome::Cancelled => {
                self.clean_up(&purpose);
                self.status(purpose.cancel_message());
                return self.roll_back();
            }
            JobOutcome::Failure(reason) => {
                warn!(job = id, ?kind, %reason, "job failed");
                self.clean_up(&purpose);
                self.status(purpose.failure_message());
                return self.roll_back();
            }
        };

        match (purpose, value) {
            (Purpose::Optimize { then_export }, JobValue::Optimized { loop_closures }) => {
                info!(loop_closures, "optimization done");
                match then_export {
                    Some(request) => match self.storage.reset_export_dir() {
                        Ok(out_dir) => self.chain(
                            JobSpec::Export(ExportParams { request, out_dir }),
                            Purpose::Export { request },
                        ),
                        Err(e) => {
                            warn!("could not prepare the export directory: {e}");
                            self.status(Purpose::Export { request }.failure_message());
                            self.roll_back()
                        }
                    },
                    None => self.finish(State::Visualizing),
                }
            }
            (Purpose::Export { request }, JobValue::Exported { dir }) => {
                self.session.view_mode = request.view_mode();
                self.session.camera_mode = CameraMode::Top;
                self.send_control(EngineControl::SetViewMode(self.session.view_mode));
                self.send_control(EngineControl::SetCameraMode(CameraMode::Top));
                self.notify(Notice::ExportCompleted { dir });
                if self.session.opened_database_path.is_none() {
                    self.notify(Notice::SaveSuggested);
                }
                self.finish(State::Visualizing)
            }
            (Purpose::Save { .. }, JobValue::Saved { path }) => {
                if let Err(e) = self.storage.finish_save() {
                    warn!("could not remove the working database: {e}");
                }
                self.session.opened_database_path = Some(path.clone());
                self.notify(Notice::DatabaseSaved { path });
                if self.session.data_recording {
                    self.send_control(EngineControl::CloseDatabase);
                    self.session.reset_map(false);
                    return self.finish(State::Welcome);
                }
                self.roll_back()
            }
            (Purpose::Open { path }, JobValue::Opened(result)) => self.on_opened(path, result),
            (Purpose::Recover, JobValue::Recovered { .. }) => {
                let path = match self.storage.promote_recovery(local_now()) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("could not keep recovered database: {e}");
                        self.clean_up(&Purpose::Recover);
                        self.status(Purpose::Recover.failure_message());
                        return self.roll_back();
                    }
                };
                self.notify(Notice::RecoveryCompleted { path: path.clone() });
                self.session.reset_map(false);
                self.chain(
                    JobSpec::Open {
                        path: path.clone(),
                        in_memory: self.settings.database_in_memory,
                        clear: false,
                    },
                    Purpose::Open { path },
                )
            }
            (purpose, value) => {
                warn!(?purpose, ?value, "job result does not match its purpose");
                self.roll_back()
            }
        }
    }

    fn on_opened(&mut self, path: PathBuf, result: OpenResult) -> SessionResult<()> {
        match result {
            OpenResult::Ready { optimized } => {
                self.session.opened_database_path = Some(path);
                if let Some(mode) = optimized {
                    self.session.view_mode = mode;
                    self.session.camera_mode = CameraMode::Top;
                    self.send_control(EngineControl::SetViewMode(mode));
                    self.finish(State::Visualizing)
                } else if self.session.state == State::VisualizingWhileLoading {
                    self.finish(State::Visualizing)
                } else {
                    self.status(MSG_LOADED);
                    self.finish(State::Idle)
                }
            }
            OpenResult::OptimizationFailed | OpenResult::OutOfMemory => {
                let msg = if result == OpenResult::OutOfMemory {
                    MSG_OUT_OF_MEMORY
                } else {
                    MSG_GRAPH_FAILED
                };
                self.status(msg);
                self.session.opened_database_path = None;
                let to = if self.session.map_node_count == 0 {
                    State::Welcome
                } else {
                    State::Idle
                };
                self.finish(to)
            }
        }
    }

    fn start_session(&mut self, data_recording: bool) -> SessionResult<()> {
        self.ensure_camera_permission()?;
        let in_memory = self.settings.database_in_memory;
        let path = self.storage.begin_working(in_memory);
        self.runner.control(EngineControl::ResetWorking {
            path,
            in_memory,
            data_recording,
        })?;
        self.session.reset_map(data_recording);
        self.runner
            .control(EngineControl::SetViewMode(ViewMode::Cloud))?;
        self.runner
            .control(EngineControl::SetCameraMode(CameraMode::FirstPerson))?;
        self.transition(State::CameraPreview)
    }

    fn submit(&mut self, spec: JobSpec, purpose: Purpose) -> SessionResult<()> {
        self.require_can_process()?;
        let job = Job::new(spec, self.settings.snapshot());
        let handle = self.runner.submit(job)?;
        self.active = Some(ActiveJob { handle, purpose });
        self.session.progress = Some(0.0);
        if self.session.state != State::Processing {
            // Chained jobs keep the state recorded before the first one.
            self.session.previous_state = Some(self.session.state);
            self.transition(State::Processing)?;
        }
        Ok(())
    }

    /// Follow a finished job with another one inside the same processing episode.
    fn chain(&mut self, spec: JobSpec, purpose: Purpose) -> SessionResult<()> {
        let failure = purpose.failure_message();
        if let Err(e) = self.submit(spec, purpose) {
            warn!("follow-up job not started: {e}");
            self.status(failure);
            self.roll_back()?;
            return Err(e);
        }
        Ok(())
    }

    fn clean_up(&mut self, purpose: &Purpose) {
        let res = match purpose {
            Purpose::Export { .. } => self.storage.reset_export_dir().map(|_| ()),
            Purpose::Recover => self.storage.discard_recovery(),
            _ => Ok(()),
        };
        if let Err(e) = res {
            warn!("cleanup after job failed: {e}");
        }
    }

    fn roll_back(&mut self) -> SessionResult<()> {
        let to = self.session.previous_state.unwrap_or(State::Idle);
        self.finish(to)
    }

    /// End the processing episode in `to`.
    fn finish(&mut self, to: State) -> SessionResult<()> {
        self.session.previous_state = None;
        self.session.progress = None;
        self.transition(to)
    }

    /// The single place the state changes; subsystems follow the table in [`State::subsystems`].
    fn transition(&mut self, to: State) -> SessionResult<()> {
        let from = self.session.state;
        if from == to {
            return Ok(());
        }
        if !from.allows(to) {
            return Err(SessionError::InvalidTransition {
                from,
                action: "change state",
            });
        }
        self.apply_subsystems(to);
        self.session.state = to;
        info!(?from, ?to, "state changed");
        self.notify(Notice::StateChanged {
            state: to,
            previous: Some(from),
        });
        Ok(())
    }

    fn apply_subsystems(&mut self, state: State) {
        let s = state.subsystems();
        self.platform.set_camera(s.camera);
        self.platform.set_location_updates(s.location);
        self.send_control(EngineControl::PauseMapping(!s.engine_running));
        self.send_control(EngineControl::LocalizationMode(s.localization));
    }

    fn send_control(&self, ctrl: EngineControl) {
        if let Err(e) = self.runner.control(ctrl) {
            warn!("engine control failed: {e:#}");
        }
    }

    fn apply_camera_mode(&mut self, mode: CameraMode) -> SessionResult<()> {
        self.runner.control(EngineControl::SetCameraMode(mode))?;
        self.session.camera_mode = mode;
        Ok(())
    }

    fn ensure_camera_permission(&mut self) -> SessionResult<()> {
        let permission = match self.platform.camera_permission() {
            CameraPermission::NotDetermined => self.platform.request_camera_permission(),
            p => p,
        };
        match permission {
            CameraPermission::Granted => Ok(()),
            _ => Err(SessionError::PermissionDenied),
        }
    }

    fn require(&self, states: &[State], action: &'static str) -> SessionResult<()> {
        if states.contains(&self.session.state) {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    /// The engine is not reentrant: refuse anything that needs it while a job runs.
    fn require_no_job(&self) -> SessionResult<()> {
        match &self.active {
            Some(active) => Err(JobError::AlreadyRunning {
                running: active.handle.kind,
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Jobs only run inside a processing episode.
    fn require_can_process(&self) -> SessionResult<()> {
        let state = self.session.state;
        if state == State::Processing || state.allows(State::Processing) {
            Ok(())
        } else {
            Err(self.invalid("start a job"))
        }
    }

    fn require_no_prompt(&self) -> SessionResult<()> {
        if self.pending_orphan.is_some() {
            return Err(SessionError::OrphanPending);
        }
        Ok(())
    }

    /// The open database plus whatever the job in flight is loading or writing.
    fn databases_in_use(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = Vec::new();
        if let Some(open) = &self.session.opened_database_path {
            paths.push(open);
        }
        if let Some(Purpose::Open { path } | Purpose::Save { path }) =
            self.active.as_ref().map(|a| &a.purpose)
        {
            paths.push(path);
        }
        paths
    }

    fn require_map(&self) -> SessionResult<()> {
        if self.session.map_node_count == 0 {
            return Err(SessionError::EmptyMap);
        }
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            from: self.session.state,
            action,
        }
    }

    fn status(&self, msg: &str) {
        self.notify(Notice::Status(msg.to_string()));
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}
