//! Text summary builder for the `status` command.
//!
//! Formats the live session counters and the last engine snapshot as human-readable lines.

use crate::session::Session;
use std::path::Path;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from the session and the storage root it works in.
pub(crate) fn build_text_summary(session: &Session, root: &Path) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Project: {}", root.display()));
    let file = session
        .opened_database_path()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "-".into());
    lines.push(format!("File: {file}"));

    match session.previous_state() {
        Some(prev) => lines.push(format!(
            "State: {} (from {})",
            session.label(),
            prev.label(session.data_recording())
        )),
        None => lines.push(format!("State: {}", session.label())),
    }
    if let Some(p) = session.progress() {
        lines.push(format!("Progress: {:.0}%", p * 100.0));
    }

    lines.push(format!(
        "Nodes: {}  Loop closures: {}",
        session.map_node_count(),
        session.loop_closures()
    ));
    lines.push(format!(
        "View: {:?} / Camera: {:?}",
        session.view_mode(),
        session.camera_mode()
    ));

    if let Some(stats) = session.last_stats() {
        lines.push(format!(
            "Memory: {} MB (database {} MB, {} words)",
            stats.memory_used_mb, stats.database_memory_mb, stats.words
        ));
        let p = &stats.pose;
        lines.push(format!(
            "Pose: xyz=({:.2}, {:.2}, {:.2}) rpy=({:.1}, {:.1}, {:.1})",
            p.x,
            p.y,
            p.z,
            p.roll.to_degrees(),
            p.pitch.to_degrees(),
            p.yaw.to_degrees()
        ));
    }

    TextSummary { lines }
}
