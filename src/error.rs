//! Error types for session orchestration.

use crate::jobs::JobKind;
use crate::session::State;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the job runner.
#[derive(Debug, Error)]
pub enum JobError {
    /// A job is already in flight; the engine is not reentrant.
    #[error("a {running:?} job is already running")]
    AlreadyRunning {
        /// Kind of the job currently in flight.
        running: JobKind,
    },
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors returned when a user intent cannot be carried out.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The intent is not available from the current state.
    #[error("cannot {action} while in {from:?}")]
    InvalidTransition {
        /// State the session was in.
        from: State,
        /// What was requested.
        action: &'static str,
    },

    /// Job submission was refused.
    #[error(transparent)]
    Job(#[from] JobError),

    /// Camera access was refused by the platform.
    #[error("Camera permission is required to start the camera. You can enable it in Settings.")]
    PermissionDenied,

    /// Mapping needs a working database.
    #[error("no working database is open")]
    NoWorkingDatabase,

    /// The operation needs a non-empty map.
    #[error("the map is empty")]
    EmptyMap,

    /// A crash remnant is waiting for a recover / ignore / defer decision.
    #[error("a previous session was not saved, choose recover, ignore or defer first")]
    OrphanPending,

    /// Saving or renaming would clobber an existing database.
    #[error("{} already exists", path.display())]
    SaveCollision {
        /// The existing database.
        path: PathBuf,
    },

    /// The target database is open in the engine.
    #[error("{} is currently open", path.display())]
    DatabaseInUse {
        /// The open database.
        path: PathBuf,
    },

    /// The name is empty, contains a path separator, or is reserved.
    #[error("invalid database name: {name}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// No saved database with that name.
    #[error("database not found: {}", path.display())]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine refused a control message.
    #[error("engine error: {0:#}")]
    Engine(#[from] anyhow::Error),
}
