use serde::{Deserialize, Serialize};

/// Session states. The camera, location updates and engine activity are a pure function of
/// the state, see [`State::subsystems`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Welcome,
    CameraPreview,
    Mapping,
    Idle,
    Processing,
    Visualizing,
    VisualizingWithCamera,
    Edit,
    VisualizingWhileLoading,
}

/// Which device and engine services are live in a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Subsystems {
    pub camera: bool,
    pub location: bool,
    pub engine_running: bool,
    pub localization: bool,
}

impl Subsystems {
    const OFF: Subsystems = Subsystems {
        camera: false,
        location: false,
        engine_running: false,
        localization: false,
    };
}

impl State {
    pub const ALL: [State; 9] = [
        State::Welcome,
        State::CameraPreview,
        State::Mapping,
        State::Idle,
        State::Processing,
        State::Visualizing,
        State::VisualizingWithCamera,
        State::Edit,
        State::VisualizingWhileLoading,
    ];

    pub fn subsystems(self) -> Subsystems {
        match self {
            State::CameraPreview => Subsystems {
                camera: true,
                location: true,
                ..Subsystems::OFF
            },
            State::Mapping => Subsystems {
                camera: true,
                location: true,
                engine_running: true,
                localization: false,
            },
            State::VisualizingWithCamera => Subsystems {
                camera: true,
                location: false,
                engine_running: true,
                localization: true,
            },
            State::Welcome
            | State::Idle
            | State::Processing
            | State::Visualizing
            | State::Edit
            | State::VisualizingWhileLoading => Subsystems::OFF,
        }
    }

    pub fn camera_live(self) -> bool {
        self.subsystems().camera
    }

    pub fn label(self, data_recording: bool) -> &'static str {
        match self {
            State::Welcome => "Welcome",
            State::CameraPreview => "Camera Preview",
            State::Mapping if data_recording => "Data Recording",
            State::Mapping => "Mapping",
            State::Idle => "Idle",
            State::Processing => "Processing",
            State::Visualizing => "Visualizing",
            State::VisualizingWithCamera => "Visualizing with Camera",
            State::Edit => "Edit",
            State::VisualizingWhileLoading => "Visualizing while Loading",
        }
    }

    /// The transition table. Every state change the machine makes is one of these edges.
    pub fn allows(self, to: State) -> bool {
        use State::*;
        if self == to {
            return false;
        }
        match self {
            // A job resolves into its success state or rolls back to wherever it started.
            Processing => true,
            Welcome => matches!(to, CameraPreview | Processing),
            CameraPreview => matches!(to, Mapping | Idle | Welcome | Processing),
            Mapping => matches!(to, Idle | Welcome | Processing),
            Idle => matches!(to, CameraPreview | Welcome | Processing),
            Visualizing => matches!(
                to,
                CameraPreview | Idle | Edit | VisualizingWithCamera | Welcome | Processing
            ),
            VisualizingWithCamera => matches!(to, Visualizing | Welcome),
            Edit => matches!(to, Visualizing | Idle),
            VisualizingWhileLoading => matches!(to, Visualizing | Idle | Welcome),
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_states_match_table() {
        let live: Vec<_> = State::ALL.into_iter().filter(|s| s.camera_live()).collect();
        assert_eq!(
            live,
            vec![
                State::CameraPreview,
                State::Mapping,
                State::VisualizingWithCamera
            ]
        );
        assert!(!State::VisualizingWithCamera.subsystems().location);
        assert!(State::VisualizingWithCamera.subsystems().localization);
        assert!(!State::CameraPreview.subsystems().engine_running);
    }

    #[test]
    fn processing_can_return_anywhere_but_itself() {
        for s in State::ALL {
            assert_eq!(State::Processing.allows(s), s != State::Processing);
        }
    }

    #[test]
    fn mapping_is_only_reached_from_preview() {
        for s in State::ALL {
            assert_eq!(
                s.allows(State::Mapping),
                matches!(s, State::CameraPreview | State::Processing),
                "{s:?}"
            );
        }
    }

    #[test]
    fn data_recording_label() {
        assert_eq!(State::Mapping.label(true), "Data Recording");
        assert_eq!(State::Mapping.label(false), "Mapping");
    }
}
