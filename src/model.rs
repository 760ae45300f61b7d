use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::session::State;

/// How the reconstructed map is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum ViewMode {
    #[default]
    Cloud,
    Mesh,
    #[value(name = "textured")]
    TexturedMesh,
}

/// Virtual camera used by the 3-D view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum CameraMode {
    #[default]
    #[value(name = "first")]
    FirstPerson,
    #[value(name = "third")]
    ThirdPerson,
    Top,
    Ortho,
}

/// Opaque key → value configuration forwarded verbatim to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSnapshot(pub BTreeMap<String, serde_json::Value>);

impl ConfigSnapshot {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Merge `other` on top of `self`, prefixing each key with `section.`.
    pub fn merge_section(&mut self, section: &str, other: &ConfigSnapshot) {
        for (k, v) in &other.0 {
            self.0.insert(format!("{section}.{k}"), v.clone());
        }
    }
}

/// Post-processing strategies understood by the engine.
///
/// The discriminants are the engine's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PostProcessApproach {
    #[default]
    Standard,
    GlobalGraph,
    BundleAdjustment,
    DetectMoreLoopClosures,
    NoiseFiltering,
    AdjustColorsFast,
    AdjustColorsFull,
    MeshSmoothing,
    Clipping,
}

impl PostProcessApproach {
    pub fn code(self) -> i32 {
        match self {
            PostProcessApproach::Standard => -1,
            PostProcessApproach::GlobalGraph => 0,
            PostProcessApproach::BundleAdjustment => 1,
            PostProcessApproach::DetectMoreLoopClosures => 2,
            PostProcessApproach::NoiseFiltering => 4,
            PostProcessApproach::AdjustColorsFast => 5,
            PostProcessApproach::AdjustColorsFull => 6,
            PostProcessApproach::MeshSmoothing => 7,
            PostProcessApproach::Clipping => 8,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "standard" => PostProcessApproach::Standard,
            "graph" => PostProcessApproach::GlobalGraph,
            "ba" | "bundle" => PostProcessApproach::BundleAdjustment,
            "loops" => PostProcessApproach::DetectMoreLoopClosures,
            "noise" => PostProcessApproach::NoiseFiltering,
            "colors-fast" => PostProcessApproach::AdjustColorsFast,
            "colors" => PostProcessApproach::AdjustColorsFull,
            "smooth" => PostProcessApproach::MeshSmoothing,
            "clip" => PostProcessApproach::Clipping,
            _ => return None,
        })
    }
}

/// What the user asked to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportKind {
    PointCloud { regenerate: bool },
    Mesh { textured: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub kind: ExportKind,
    pub optimized: bool,
    pub max_polygons: u32,
}

impl ExportRequest {
    /// Colored mesh assembled right after a standard optimization.
    pub fn standard_mesh() -> Self {
        Self {
            kind: ExportKind::Mesh { textured: false },
            optimized: true,
            max_polygons: 200_000,
        }
    }

    pub fn meshing(&self) -> bool {
        matches!(self.kind, ExportKind::Mesh { .. })
    }

    /// View mode the session switches to once this export succeeds.
    pub fn view_mode(&self) -> ViewMode {
        match self.kind {
            ExportKind::PointCloud { .. } => ViewMode::Cloud,
            ExportKind::Mesh { textured: false } => ViewMode::Mesh,
            ExportKind::Mesh { textured: true } => ViewMode::TexturedMesh,
        }
    }
}

/// Everything the engine needs for one export besides the opaque job parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportParams {
    pub request: ExportRequest,
    pub out_dir: PathBuf,
}

/// Result of opening a database in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenResult {
    /// Map usable; `optimized` is set when the database already holds an optimized representation.
    Ready { optimized: Option<ViewMode> },
    OptimizationFailed,
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEvent {
    pub timestamp_utc: String,
    pub nodes: u32,
    pub words: u32,
    pub loop_closure_id: i32,
    pub database_memory_mb: u32,
    pub memory_used_mb: u64,
    pub pose: Pose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub count: u32,
    pub max: u32,
}

impl ProgressEvent {
    pub fn fraction(&self) -> f32 {
        if self.max == 0 {
            return 0.0;
        }
        (self.count as f32 / self.max as f32).clamp(0.0, 1.0)
    }
}

/// Events pushed by the engine, either during a job or while the camera is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    Progress(ProgressEvent),
    Stats(Box<StatsEvent>),
    InitMessage { status: i32, text: String },
}

/// Messages shown to the user by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    StateChanged {
        state: State,
        previous: Option<State>,
    },
    Progress {
        job: u64,
        fraction: f32,
    },
    Status(String),
    OrphanDetected {
        path: PathBuf,
        size_bytes: u64,
    },
    SaveCollision {
        path: PathBuf,
    },
    DatabaseSaved {
        path: PathBuf,
    },
    RecoveryCompleted {
        path: PathBuf,
    },
    ExportCompleted {
        dir: PathBuf,
    },
    SaveSuggested,
    Databases(Vec<String>),
}

impl Notice {
    /// Render a human-readable message for text front-ends.
    pub fn to_message(&self) -> String {
        match self {
            Notice::StateChanged { state, previous } => match previous {
                Some(p) => format!("State: {state:?} (was {p:?})"),
                None => format!("State: {state:?}"),
            },
            Notice::Progress { job, fraction } => {
                format!("Job {job}: {:.0}%", fraction * 100.0)
            }
            Notice::Status(msg) => msg.clone(),
            Notice::OrphanDetected { path, size_bytes } => format!(
                "The previous session ({}) was not correctly saved, do you want to recover it? [{}] (recover / ignore / defer)",
                human_size(*size_bytes),
                path.display()
            ),
            Notice::SaveCollision { path } => format!(
                "{} already exists, save again with --overwrite to replace it.",
                path.display()
            ),
            Notice::DatabaseSaved { path } => format!("Database \"{}\" successfully saved.", file_name(path)),
            Notice::RecoveryCompleted { path } => {
                format!("Database \"{}\" successfully recovered.", file_name(path))
            }
            Notice::ExportCompleted { dir } => format!("Exported to {}", dir.display()),
            Notice::SaveSuggested => "Map is not saved yet, use `save <name>` to keep it.".to_string(),
            Notice::Databases(names) if names.is_empty() => "No saved databases.".to_string(),
            Notice::Databases(names) => names.join("\n"),
        }
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn human_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MB {
        format!("{:.1} MB", bytes as f64 / MB)
    } else {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fraction_handles_zero_max() {
        assert_eq!(ProgressEvent { count: 3, max: 0 }.fraction(), 0.0);
        assert_eq!(ProgressEvent { count: 1, max: 4 }.fraction(), 0.25);
        assert_eq!(ProgressEvent { count: 9, max: 4 }.fraction(), 1.0);
    }

    #[test]
    fn export_view_modes() {
        assert_eq!(ExportRequest::standard_mesh().view_mode(), ViewMode::Mesh);
        let cloud = ExportRequest {
            kind: ExportKind::PointCloud { regenerate: true },
            optimized: false,
            max_polygons: 0,
        };
        assert_eq!(cloud.view_mode(), ViewMode::Cloud);
        assert!(!cloud.meshing());
    }

    #[test]
    fn approach_codes_match_engine_values() {
        assert_eq!(PostProcessApproach::Standard.code(), -1);
        assert_eq!(PostProcessApproach::parse("clip").map(|a| a.code()), Some(8));
        assert_eq!(PostProcessApproach::parse("nope"), None);
    }

    #[test]
    fn snapshot_sections_are_prefixed() {
        let mut export = ConfigSnapshot::default();
        export.0.insert("voxel_size".into(), serde_json::json!(0.01));
        let mut merged = ConfigSnapshot::default();
        merged.merge_section("export", &export);
        assert_eq!(merged.get("export.voxel_size"), Some(&serde_json::json!(0.01)));
    }
}
