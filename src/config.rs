//! Settings consumed by the session: storage behavior plus the opaque engine sections that are
//! forwarded inside every job.

use crate::model::ConfigSnapshot;
use crate::storage::DEFAULT_RECOVERY_THRESHOLD;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Keep the working database in engine memory while mapping.
    pub database_in_memory: bool,
    /// Chain a mesh export after the optimization that follows a scan.
    pub lidar_mode: bool,
    pub recovery_threshold_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub cancel_watchdog: Duration,
    pub mapping: ConfigSnapshot,
    pub rendering: ConfigSnapshot,
    pub export: ConfigSnapshot,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_in_memory: true,
            lidar_mode: false,
            recovery_threshold_bytes: DEFAULT_RECOVERY_THRESHOLD,
            cancel_watchdog: Duration::from_secs(3),
            mapping: ConfigSnapshot::default(),
            rendering: ConfigSnapshot::default(),
            export: ConfigSnapshot::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse settings {}", path.display()))
    }

    /// Flattened snapshot handed to the engine with each job.
    pub fn snapshot(&self) -> ConfigSnapshot {
        let mut out = ConfigSnapshot::default();
        out.merge_section("mapping", &self.mapping);
        out.merge_section("rendering", &self.rendering);
        out.merge_section("export", &self.export);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "lidar_mode": true, "cancel_watchdog": "500ms", "export": { "voxel_size": 0.01 } }"#,
        )
        .unwrap();

        let s = Settings::load(&path).unwrap();
        assert!(s.lidar_mode);
        assert!(s.database_in_memory);
        assert_eq!(s.cancel_watchdog, Duration::from_millis(500));
        assert_eq!(s.recovery_threshold_bytes, 1024 * 1024);
        assert_eq!(
            s.snapshot().get("export.voxel_size"),
            Some(&serde_json::json!(0.01))
        );
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("settings.json"));
    }
}
