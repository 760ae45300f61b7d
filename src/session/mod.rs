//! The session: one live scanning context and the state machine that owns it.
//!
//! All mutation goes through [`SessionMachine`], which runs on the interactive context. Long
//! engine work is handed to the [`JobRunner`](crate::jobs::JobRunner) and its resolution comes
//! back through [`SessionMachine::handle_runner_event`].

mod machine;
mod state;

pub use machine::{OrphanChoice, SessionMachine, StopMode};
pub use state::State;

use crate::model::{CameraMode, StatsEvent, ViewMode};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    state: State,
    previous_state: Option<State>,
    data_recording: bool,
    view_mode: ViewMode,
    camera_mode: CameraMode,
    map_node_count: u32,
    loop_closures: u32,
    opened_database_path: Option<PathBuf>,
    progress: Option<f32>,
    crop_active: bool,
    last_stats: Option<StatsEvent>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: State::Welcome,
            previous_state: None,
            data_recording: false,
            view_mode: ViewMode::Cloud,
            camera_mode: CameraMode::FirstPerson,
            map_node_count: 0,
            loop_closures: 0,
            opened_database_path: None,
            progress: None,
            crop_active: false,
            last_stats: None,
        }
    }
}

impl Session {
    pub fn state(&self) -> State {
        self.state
    }

    /// State a running job rolls back to on failure or cancellation.
    pub fn previous_state(&self) -> Option<State> {
        self.previous_state
    }

    pub fn data_recording(&self) -> bool {
        self.data_recording
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    pub fn camera_mode(&self) -> CameraMode {
        self.camera_mode
    }

    pub fn map_node_count(&self) -> u32 {
        self.map_node_count
    }

    /// Loop closures reported since the map was started.
    pub fn loop_closures(&self) -> u32 {
        self.loop_closures
    }

    pub fn opened_database_path(&self) -> Option<&Path> {
        self.opened_database_path.as_deref()
    }

    /// Progress of the job in flight, in `[0, 1]`.
    pub fn progress(&self) -> Option<f32> {
        self.progress
    }

    pub fn crop_active(&self) -> bool {
        self.crop_active
    }

    pub fn last_stats(&self) -> Option<&StatsEvent> {
        self.last_stats.as_ref()
    }

    pub fn label(&self) -> &'static str {
        self.state.label(self.data_recording)
    }

    /// Forget the current map, e.g. when a new scan starts.
    fn reset_map(&mut self, data_recording: bool) {
        self.data_recording = data_recording;
        self.view_mode = ViewMode::Cloud;
        self.camera_mode = CameraMode::FirstPerson;
        self.map_node_count = 0;
        self.loop_closures = 0;
        self.opened_database_path = None;
        self.crop_active = false;
        self.last_stats = None;
    }
}
