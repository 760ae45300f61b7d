use crate::config::Settings;
use crate::engine::FileEngine;
use crate::model::{CameraMode, ExportKind, ExportRequest, Notice, PostProcessApproach, ViewMode};
use crate::orchestrator::{run_controller, UiCommand};
use crate::platform::HeadlessPlatform;
use crate::session::{OrphanChoice, SessionMachine, StopMode};
use crate::storage::DatabaseManager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "slashscan",
    version,
    about = "Drive a 3-D scanning session (capture, map, optimize, export) from the terminal"
)]
pub struct Cli {
    /// Storage root for working, recovery and saved databases [default: <Documents>/SlashScan]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// JSON settings file
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Read commands from this file instead of stdin
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Print notices as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Keep the working database in engine memory while mapping (overrides settings)
    #[arg(long, action = clap::ArgAction::Set)]
    pub in_memory: Option<bool>,

    /// Export an optimized mesh right after the optimization that follows a scan
    #[arg(long)]
    pub lidar: bool,

    /// How long a cancel may take before "Still cancelling…" is shown (overrides settings)
    #[arg(long)]
    pub cancel_watchdog: Option<humantime::Duration>,

    /// Simulated duration of one engine processing step
    #[arg(long, default_value = "50ms")]
    pub step_delay: humantime::Duration,

    /// Databases larger than this many bytes fail to load with "not enough memory"
    #[arg(long)]
    pub max_load_bytes: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Settings file (if any) with command-line overrides applied.
pub fn build_settings(args: &Cli) -> Result<Settings> {
    let mut settings = match args.settings.as_deref() {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(in_memory) = args.in_memory {
        settings.database_in_memory = in_memory;
    }
    if args.lidar {
        settings.lidar_mode = true;
    }
    if let Some(d) = args.cancel_watchdog {
        settings.cancel_watchdog = d.into();
    }
    Ok(settings)
}

fn resolve_root(args: &Cli) -> Result<PathBuf> {
    match &args.root {
        Some(root) => Ok(root.clone()),
        None => dirs::document_dir()
            .or_else(dirs::home_dir)
            .map(|d| d.join("SlashScan"))
            .context("no documents directory found; pass --root"),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let settings = build_settings(&args)?;
    let root = resolve_root(&args)?;
    let storage = DatabaseManager::new(&root, settings.recovery_threshold_bytes)
        .with_context(|| format!("failed to prepare storage root {}", root.display()))?;

    let mut engine = FileEngine::new(args.step_delay.into());
    if let Some(limit) = args.max_load_bytes {
        engine = engine.with_max_load_bytes(limit);
    }
    let platform = HeadlessPlatform::granted().with_depth(true);

    let (notice_tx, notice_rx) = mpsc::unbounded_channel::<Notice>();
    let (machine, runner_rx) = SessionMachine::new(
        Arc::new(engine),
        platform,
        storage,
        settings.clone(),
        notice_tx.clone(),
    );

    let (out_tx, out_handle) = spawn_output_writer();
    let printer = tokio::spawn(print_notices(notice_rx, out_tx.clone(), args.json));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let ctrl_c_tx = cmd_tx.clone();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c_tx.send(UiCommand::Quit);
        }
    });
    let reader = match args.script.as_deref() {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open script {}", path.display()))?;
            tokio::spawn(read_commands(BufReader::new(file), cmd_tx, out_tx.clone()))
        }
        None => tokio::spawn(read_commands(
            BufReader::new(tokio::io::stdin()),
            cmd_tx,
            out_tx.clone(),
        )),
    };

    run_controller(machine, runner_rx, cmd_rx, notice_tx, settings.cancel_watchdog).await?;

    reader.abort();
    signals.abort();
    let _ = printer.await;
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn read_commands<R: AsyncBufRead + Unpin>(
    input: R,
    cmd_tx: mpsc::UnboundedSender<UiCommand>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) {
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_command(&line) {
                Ok(Some(cmd)) => {
                    if cmd_tx.send(cmd).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(msg) => {
                    let _ = out_tx.send(OutputLine::Stderr(msg));
                }
            },
            Ok(None) => break,
            Err(e) => {
                let _ = out_tx.send(OutputLine::Stderr(format!("input error: {e}")));
                break;
            }
        }
    }
    // End of input lets the job in flight finish instead of cancelling it.
    let _ = cmd_tx.send(UiCommand::Wait);
    let _ = cmd_tx.send(UiCommand::Quit);
}

async fn print_notices(
    mut notice_rx: mpsc::UnboundedReceiver<Notice>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    json: bool,
) {
    while let Some(notice) = notice_rx.recv().await {
        let line = if json {
            match serde_json::to_string(&notice) {
                Ok(s) => OutputLine::Stdout(s),
                Err(e) => OutputLine::Stderr(format!("unserializable notice: {e}")),
            }
        } else if matches!(notice, Notice::Progress { .. }) {
            OutputLine::Stderr(notice.to_message())
        } else {
            OutputLine::Stdout(notice.to_message())
        };
        let _ = out_tx.send(line);
    }
}

/// One line of the command language.
#[derive(Debug, Parser)]
#[command(name = "command", no_binary_name = true, disable_version_flag = true)]
struct ScriptLine {
    #[command(subcommand)]
    command: ScriptCommand,
}

#[derive(Debug, Subcommand)]
enum ScriptCommand {
    /// Start a new scan, offering to recover an unsaved one first
    New {
        /// Record raw data instead of building a map
        #[arg(long)]
        record_data: bool,
    },
    /// Recover the unsaved previous session
    Recover,
    /// Delete the unsaved previous session and continue
    Ignore,
    /// Keep the unsaved previous session and abandon the new scan
    Defer,
    /// Turn the camera on
    Camera,
    /// Start mapping
    Record,
    /// Stop the camera (optimizes by default)
    Stop {
        /// Throw the scan away
        #[arg(long, conflicts_with = "suspend")]
        discard: bool,
        /// Keep the scan without optimizing
        #[arg(long)]
        suspend: bool,
    },
    /// Feed camera frames to the engine
    Frames { count: u32 },
    /// Post-process the map
    Optimize {
        #[arg(default_value = "standard", value_parser = parse_approach)]
        approach: PostProcessApproach,
    },
    /// Export the map into the export directory
    Export {
        #[arg(value_enum, default_value_t = ExportTarget::Mesh)]
        kind: ExportTarget,
        /// Texture the mesh
        #[arg(long)]
        textured: bool,
        /// Regenerate the point cloud from raw data
        #[arg(long)]
        regenerate: bool,
        /// Export the map as recorded, without optimization
        #[arg(long)]
        raw: bool,
        /// Decimate the mesh to this many polygons (0 keeps all)
        #[arg(long, default_value_t = 0)]
        max_polygons: u32,
    },
    /// Save the scan under a name
    Save {
        name: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Load a saved database
    Open { name: String },
    /// Leave the map view
    Close,
    /// Enter measurement mode
    Measure,
    /// Leave measurement mode
    Done,
    /// Toggle the crop selection
    Crop,
    /// Change how the map is rendered
    View {
        #[arg(value_enum)]
        mode: ViewMode,
    },
    /// Change the virtual camera
    Cam {
        #[arg(value_enum)]
        mode: CameraMode,
    },
    /// Cancel the job in flight
    Cancel,
    /// Simulate the app moving to the background
    Background,
    /// Report a render-loop status code
    Render {
        #[arg(allow_negative_numbers = true)]
        code: i32,
    },
    /// List saved databases
    List,
    /// Rename a saved database
    Rename {
        from: String,
        to: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Delete a saved database
    Delete { name: String },
    /// Print the session summary
    Status,
    /// Hold further commands until the job in flight resolves
    Wait,
    /// Cancel any job in flight and exit
    #[command(alias = "exit")]
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportTarget {
    Cloud,
    Mesh,
}

fn parse_approach(s: &str) -> Result<PostProcessApproach, String> {
    PostProcessApproach::parse(s).ok_or_else(|| format!("unknown approach {s:?}"))
}

impl From<ScriptCommand> for UiCommand {
    fn from(cmd: ScriptCommand) -> Self {
        match cmd {
            ScriptCommand::New { record_data } => UiCommand::NewScan {
                data_recording: record_data,
            },
            ScriptCommand::Recover => UiCommand::ResolveOrphan(OrphanChoice::Recover),
            ScriptCommand::Ignore => UiCommand::ResolveOrphan(OrphanChoice::Ignore),
            ScriptCommand::Defer => UiCommand::ResolveOrphan(OrphanChoice::Defer),
            ScriptCommand::Camera => UiCommand::StartCamera,
            ScriptCommand::Record => UiCommand::Record,
            ScriptCommand::Stop { discard, suspend } => UiCommand::Stop(if discard {
                StopMode::Discard
            } else if suspend {
                StopMode::Suspend
            } else {
                StopMode::Optimize
            }),
            ScriptCommand::Frames { count } => UiCommand::Frames(count),
            ScriptCommand::Optimize { approach } => UiCommand::Optimize(approach),
            ScriptCommand::Export {
                kind,
                textured,
                regenerate,
                raw,
                max_polygons,
            } => UiCommand::Export(ExportRequest {
                kind: match kind {
                    ExportTarget::Cloud => ExportKind::PointCloud { regenerate },
                    ExportTarget::Mesh => ExportKind::Mesh { textured },
                },
                optimized: !raw,
                max_polygons,
            }),
            ScriptCommand::Save { name, overwrite } => UiCommand::Save { name, overwrite },
            ScriptCommand::Open { name } => UiCommand::Open(name),
            ScriptCommand::Close => UiCommand::CloseVisualization,
            ScriptCommand::Measure => UiCommand::Measure,
            ScriptCommand::Done => UiCommand::DoneMeasuring,
            ScriptCommand::Crop => UiCommand::ToggleCrop,
            ScriptCommand::View { mode } => UiCommand::SetViewMode(mode),
            ScriptCommand::Cam { mode } => UiCommand::SetCameraMode(mode),
            ScriptCommand::Cancel => UiCommand::Cancel,
            ScriptCommand::Background => UiCommand::Background,
            ScriptCommand::Render { code } => UiCommand::RenderStatus(code),
            ScriptCommand::List => UiCommand::List,
            ScriptCommand::Rename {
                from,
                to,
                overwrite,
            } => UiCommand::Rename {
                from,
                to,
                overwrite,
            },
            ScriptCommand::Delete { name } => UiCommand::Delete(name),
            ScriptCommand::Status => UiCommand::Status,
            ScriptCommand::Wait => UiCommand::Wait,
            ScriptCommand::Quit => UiCommand::Quit,
        }
    }
}

/// Parse one line of the command language. Blank lines and `#` comments yield `None`.
pub(crate) fn parse_command(line: &str) -> Result<Option<UiCommand>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let parsed = ScriptLine::try_parse_from(line.split_whitespace())
        .map_err(|e| e.to_string().trim_end().to_string())?;
    Ok(Some(parsed.command.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert_eq!(parse_command("   "), Ok(None));
        assert_eq!(parse_command("# scan the kitchen"), Ok(None));
    }

    #[test]
    fn stop_modes() {
        assert_eq!(
            parse_command("stop"),
            Ok(Some(UiCommand::Stop(StopMode::Optimize)))
        );
        assert_eq!(
            parse_command("stop --discard"),
            Ok(Some(UiCommand::Stop(StopMode::Discard)))
        );
        assert_eq!(
            parse_command("stop --suspend"),
            Ok(Some(UiCommand::Stop(StopMode::Suspend)))
        );
    }

    #[test]
    fn export_options() {
        assert_eq!(
            parse_command("export mesh --textured --max-polygons 5000"),
            Ok(Some(UiCommand::Export(ExportRequest {
                kind: ExportKind::Mesh { textured: true },
                optimized: true,
                max_polygons: 5000,
            })))
        );
        assert_eq!(
            parse_command("export cloud --raw"),
            Ok(Some(UiCommand::Export(ExportRequest {
                kind: ExportKind::PointCloud { regenerate: false },
                optimized: false,
                max_polygons: 0,
            })))
        );
        assert!(parse_command("export voxels").is_err());
        assert_eq!(
            parse_command("export --max-polygons 5000"),
            Ok(Some(UiCommand::Export(ExportRequest {
                kind: ExportKind::Mesh { textured: false },
                optimized: true,
                max_polygons: 5000,
            })))
        );
    }

    #[test]
    fn save_and_rename_arguments() {
        assert_eq!(
            parse_command("save kitchen --overwrite"),
            Ok(Some(UiCommand::Save {
                name: "kitchen".into(),
                overwrite: true
            }))
        );
        assert_eq!(
            parse_command("rename a b"),
            Ok(Some(UiCommand::Rename {
                from: "a".into(),
                to: "b".into(),
                overwrite: false
            }))
        );
        assert!(parse_command("save").is_err());
    }

    #[test]
    fn unknown_input_is_reported() {
        assert!(parse_command("fly").is_err());
        assert!(parse_command("optimize harder").is_err());
        assert!(parse_command("frames many").is_err());
        assert!(parse_command("stop --discard --suspend").is_err());
    }

    #[test]
    fn modes_and_codes() {
        assert_eq!(
            parse_command("view textured"),
            Ok(Some(UiCommand::SetViewMode(ViewMode::TexturedMesh)))
        );
        assert_eq!(
            parse_command("cam first"),
            Ok(Some(UiCommand::SetCameraMode(CameraMode::FirstPerson)))
        );
        assert_eq!(
            parse_command("render -2"),
            Ok(Some(UiCommand::RenderStatus(-2)))
        );
        assert_eq!(
            parse_command("optimize loops"),
            Ok(Some(UiCommand::Optimize(
                PostProcessApproach::DetectMoreLoopClosures
            )))
        );
        assert_eq!(parse_command("exit"), Ok(Some(UiCommand::Quit)));
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let args = Cli::parse_from([
            "slashscan",
            "--lidar",
            "--in-memory",
            "false",
            "--cancel-watchdog",
            "1s",
        ]);
        let s = build_settings(&args).unwrap();
        assert!(s.lidar_mode);
        assert!(!s.database_in_memory);
        assert_eq!(s.cancel_watchdog, std::time::Duration::from_secs(1));
    }
}
