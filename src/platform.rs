//! Device services the session switches on and off: camera capture, location updates and the
//! camera permission prompt.

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CameraPermission {
    Granted,
    Denied,
    #[default]
    NotDetermined,
}

pub trait Platform {
    fn camera_permission(&self) -> CameraPermission;

    /// Prompt the user. Only meaningful while the permission is undetermined.
    fn request_camera_permission(&mut self) -> CameraPermission;

    fn set_camera(&mut self, on: bool);

    fn set_location_updates(&mut self, on: bool);

    /// Whether the device has a depth sensor (LiDAR).
    fn depth_supported(&self) -> bool;
}

/// Platform for terminals and tests: the camera is a flag, the permission prompt answers with a
/// preset value.
#[derive(Debug, Clone, Default)]
pub struct HeadlessPlatform {
    permission: CameraPermission,
    prompt_answer: Option<CameraPermission>,
    camera_on: bool,
    location_on: bool,
    depth: bool,
}

impl HeadlessPlatform {
    pub fn granted() -> Self {
        Self {
            permission: CameraPermission::Granted,
            ..Self::default()
        }
    }

    pub fn with_permission(permission: CameraPermission) -> Self {
        Self {
            permission,
            ..Self::default()
        }
    }

    /// What the next prompt resolves to while the permission is undetermined.
    pub fn answering(mut self, answer: CameraPermission) -> Self {
        self.prompt_answer = Some(answer);
        self
    }

    pub fn with_depth(mut self, depth: bool) -> Self {
        self.depth = depth;
        self
    }

    pub fn camera_on(&self) -> bool {
        self.camera_on
    }

    pub fn location_on(&self) -> bool {
        self.location_on
    }
}

impl Platform for HeadlessPlatform {
    fn camera_permission(&self) -> CameraPermission {
        self.permission
    }

    fn request_camera_permission(&mut self) -> CameraPermission {
        if self.permission == CameraPermission::NotDetermined {
            if let Some(answer) = self.prompt_answer {
                self.permission = answer;
            }
        }
        self.permission
    }

    fn set_camera(&mut self, on: bool) {
        if self.camera_on != on {
            debug!(on, "camera");
        }
        self.camera_on = on;
    }

    fn set_location_updates(&mut self, on: bool) {
        if self.location_on != on {
            debug!(on, "location updates");
        }
        self.location_on = on;
    }

    fn depth_supported(&self) -> bool {
        self.depth
    }
}
