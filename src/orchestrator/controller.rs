//! Session controller.
//!
//! The interactive context: owns the session machine, applies user commands and runner events
//! in arrival order, and emits notices for presentation layers.

use crate::error::SessionResult;
use crate::jobs::RunnerEvent;
use crate::model::{CameraMode, ExportRequest, Notice, PostProcessApproach, ViewMode};
use crate::platform::Platform;
use crate::session::{OrphanChoice, SessionMachine, State, StopMode};
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Commands emitted by UI layers to drive the session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UiCommand {
    NewScan { data_recording: bool },
    ResolveOrphan(OrphanChoice),
    StartCamera,
    Record,
    Stop(StopMode),
    /// Feed this many camera frames to the engine.
    Frames(u32),
    Optimize(PostProcessApproach),
    Export(ExportRequest),
    Save { name: String, overwrite: bool },
    Open(String),
    CloseVisualization,
    Measure,
    DoneMeasuring,
    ToggleCrop,
    SetViewMode(ViewMode),
    SetCameraMode(CameraMode),
    Cancel,
    Background,
    RenderStatus(i32),
    List,
    Rename { from: String, to: String, overwrite: bool },
    Delete(String),
    Status,
    /// Hold further commands until the job in flight has resolved.
    Wait,
    Quit,
}

/// Apply commands and runner events to the session until quit (or end of input) and no job is
/// left in flight.
pub(crate) async fn run_controller<P: Platform>(
    mut machine: SessionMachine<P>,
    mut runner_rx: UnboundedReceiver<RunnerEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
    notice_tx: UnboundedSender<Notice>,
    cancel_watchdog: Duration,
) -> Result<()> {
    let mut quit_pending = false;
    let mut waiting = false;
    // Cancel watchdog: if a cancel takes too long, emit a status message to keep UI feedback alive.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(250));
    let status = |msg: String| {
        let _ = notice_tx.send(Notice::Status(msg));
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending && !waiting => {
                match cmd {
                    Some(UiCommand::Quit) | None => {
                        // Quit waits for the job in flight so its files are finalized.
                        quit_pending = true;
                        if machine.state() == State::Processing {
                            if let Ok(true) = machine.cancel_job() {
                                status("Cancelling…".into());
                                cancel_deadline = Some(tokio::time::Instant::now() + cancel_watchdog);
                            }
                        }
                    }
                    Some(UiCommand::Wait) => {
                        waiting = machine.job_in_flight().is_some();
                    }
                    Some(UiCommand::Cancel) => match machine.cancel_job() {
                        Ok(true) => {
                            status("Cancelling…".into());
                            cancel_deadline = Some(tokio::time::Instant::now() + cancel_watchdog);
                        }
                        Ok(false) => debug!("cancellation already requested"),
                        Err(e) => status(e.to_string()),
                    },
                    Some(UiCommand::Status) => {
                        let summary = crate::text_summary::build_text_summary(
                            machine.session(),
                            machine.storage().root(),
                        );
                        for line in summary.lines {
                            status(line);
                        }
                    }
                    Some(cmd) => {
                        debug!(?cmd, "command");
                        if let Err(e) = apply(&mut machine, cmd) {
                            warn!("command refused: {e}");
                            status(e.to_string());
                        }
                    }
                }
            }
            Some(event) = runner_rx.recv() => {
                let resolved = matches!(event, RunnerEvent::Resolved(_));
                if let Err(e) = machine.handle_runner_event(event) {
                    warn!("runner event not applied: {e}");
                    status(e.to_string());
                }
                if resolved && machine.job_in_flight().is_none() {
                    cancel_deadline = None;
                    waiting = false;
                }
            }
            // If cancel stalls (the engine is mid-step), keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && machine.job_in_flight().is_some() {
                        status("Still cancelling…".into());
                        cancel_deadline = None;
                    }
                }
            }
        }

        if quit_pending && machine.job_in_flight().is_none() {
            break;
        }
    }

    // Leave an interrupted scan on disk for the next launch.
    if machine.state().camera_live() {
        if let Err(e) = machine.app_backgrounded() {
            warn!("could not suspend the camera session: {e}");
        }
    }
    info!(state = ?machine.state(), "controller stopped");
    Ok(())
}

fn apply<P: Platform>(machine: &mut SessionMachine<P>, cmd: UiCommand) -> SessionResult<()> {
    match cmd {
        UiCommand::NewScan { data_recording } => machine.new_scan(data_recording),
        UiCommand::ResolveOrphan(choice) => machine.resolve_orphan(choice),
        UiCommand::StartCamera => machine.start_camera(),
        UiCommand::Record => machine.record(),
        UiCommand::Stop(mode) => machine.stop(mode),
        UiCommand::Frames(n) => {
            for _ in 0..n {
                machine.post_frame()?;
            }
            Ok(())
        }
        UiCommand::Optimize(approach) => machine.optimize(approach),
        UiCommand::Export(request) => machine.export(request),
        UiCommand::Save { name, overwrite } => machine.save(&name, overwrite),
        UiCommand::Open(name) => machine.open(&name),
        UiCommand::CloseVisualization => machine.close_visualization(),
        UiCommand::Measure => machine.measure(),
        UiCommand::DoneMeasuring => machine.done_measuring(),
        UiCommand::ToggleCrop => machine.toggle_crop().map(|_| ()),
        UiCommand::SetViewMode(mode) => machine.set_view_mode(mode),
        UiCommand::SetCameraMode(mode) => machine.set_camera_mode(mode),
        UiCommand::Background => machine.app_backgrounded(),
        UiCommand::RenderStatus(code) => {
            machine.on_render_status(code);
            Ok(())
        }
        UiCommand::List => machine.list_databases().map(|_| ()),
        UiCommand::Rename {
            from,
            to,
            overwrite,
        } => machine.rename_database(&from, &to, overwrite).map(|_| ()),
        UiCommand::Delete(name) => machine.delete_database(&name).map(|_| ()),
        UiCommand::Cancel | UiCommand::Status | UiCommand::Wait | UiCommand::Quit => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::testing::{Script, ScriptedEngine};
    use crate::platform::HeadlessPlatform;
    use crate::storage::DatabaseManager;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn quit_cancels_and_waits_for_job() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("scan.db"), b"{}").unwrap();
        let engine = Arc::new(ScriptedEngine::new(true));
        engine.set_script(Script::HonorCancel);
        let storage = DatabaseManager::new(dir.path(), 1024 * 1024).unwrap();
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let (machine, runner_rx) = SessionMachine::new(
            engine.clone(),
            HeadlessPlatform::granted(),
            storage,
            Settings::default(),
            notice_tx.clone(),
        );
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        cmd_tx.send(UiCommand::Open("scan".into())).unwrap();
        cmd_tx.send(UiCommand::Quit).unwrap();

        let controller = tokio::spawn(run_controller(
            machine,
            runner_rx,
            cmd_rx,
            notice_tx,
            Duration::from_secs(3),
        ));

        let mut seen = Vec::new();
        loop {
            let n = notice_rx.recv().await.unwrap();
            let cancelling = n == Notice::Status("Cancelling…".into());
            seen.push(n);
            if cancelling {
                break;
            }
        }
        assert!(!controller.is_finished());
        engine.release();
        controller.await.unwrap().unwrap();
        while let Ok(n) = notice_rx.try_recv() {
            seen.push(n);
        }

        let states: Vec<_> = seen
            .iter()
            .filter_map(|n| match n {
                Notice::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![State::Processing, State::Welcome]);
        assert!(seen.contains(&Notice::Status("Loading canceled".into())));
    }
}
