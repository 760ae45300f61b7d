//! On-disk database lifecycle: the working database, the recovery target, saved databases and
//! the export directory, all under one storage root.

use crate::error::{SessionError, SessionResult};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const WORKING_DB: &str = "slashscan.tmp.db";
pub const RECOVERY_DB: &str = "slashscan.tmp.recovery.db";
pub const EXPORT_DIR: &str = "Export";
pub const DB_EXTENSION: &str = "db";

/// Working databases at or below this size are fresh, empty sessions and never offered for
/// recovery.
pub const DEFAULT_RECOVERY_THRESHOLD: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DatabaseKind {
    Working,
    Recovery,
    Saved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseHandle {
    pub path: PathBuf,
    pub kind: DatabaseKind,
    pub size_bytes: u64,
    pub in_memory: bool,
}

impl DatabaseHandle {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct DatabaseManager {
    root: PathBuf,
    recovery_threshold: u64,
    working: Option<DatabaseHandle>,
    recovery: Option<DatabaseHandle>,
}

impl DatabaseManager {
    /// Use `root` as the storage root, creating it if needed.
    pub fn new(root: impl Into<PathBuf>, recovery_threshold: u64) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            recovery_threshold,
            working: None,
            recovery: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn working_path(&self) -> PathBuf {
        self.root.join(WORKING_DB)
    }

    pub fn recovery_path(&self) -> PathBuf {
        self.root.join(RECOVERY_DB)
    }

    pub fn export_dir(&self) -> PathBuf {
        self.root.join(EXPORT_DIR)
    }

    pub fn working(&self) -> Option<&DatabaseHandle> {
        self.working.as_ref()
    }

    /// A working database left on disk that no live camera session owns and that is large
    /// enough to hold real data.
    pub fn detect_orphan(&self, claimed: bool) -> Option<DatabaseHandle> {
        if claimed {
            return None;
        }
        let path = self.working_path();
        let size_bytes = fs::metadata(&path).ok()?.len();
        if size_bytes <= self.recovery_threshold {
            debug!(size_bytes, "working database below recovery threshold");
            return None;
        }
        Some(DatabaseHandle {
            path,
            kind: DatabaseKind::Working,
            size_bytes,
            in_memory: false,
        })
    }

    /// Record the working database the engine is about to create at [`Self::working_path`].
    pub fn begin_working(&mut self, in_memory: bool) -> PathBuf {
        let path = self.working_path();
        info!(path = %path.display(), in_memory, "working database created");
        self.working = Some(DatabaseHandle {
            path: path.clone(),
            kind: DatabaseKind::Working,
            size_bytes: 0,
            in_memory,
        });
        path
    }

    /// Delete the working database, whether or not this session created it.
    pub fn discard_working(&mut self) -> io::Result<()> {
        self.working = None;
        remove_if_exists(&self.working_path())
    }

    /// Current size of the working database file, if any.
    pub fn refresh_working(&mut self) -> Option<u64> {
        let path = self.working_path();
        let handle = self.working.as_mut()?;
        handle.size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Some(handle.size_bytes)
    }

    /// Clear any stale recovery output and return where the next recovery should write.
    pub fn prepare_recovery_target(&mut self) -> io::Result<PathBuf> {
        let path = self.recovery_path();
        remove_if_exists(&path)?;
        self.recovery = Some(DatabaseHandle {
            path: path.clone(),
            kind: DatabaseKind::Recovery,
            size_bytes: 0,
            in_memory: false,
        });
        Ok(path)
    }

    /// Turn a successful recovery into a saved database named after `now`, then drop the
    /// working database it was rebuilt from.
    pub fn promote_recovery(&mut self, now: OffsetDateTime) -> io::Result<PathBuf> {
        let from = match self.recovery.take() {
            Some(handle) => handle.path,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no recovery in progress",
                ))
            }
        };
        let mut to = self.root.join(recovery_name(now));
        let mut n = 1;
        while to.exists() {
            let stem = recovery_name(now);
            let stem = stem.trim_end_matches(".db");
            to = self.root.join(format!("{stem}-{n}.{DB_EXTENSION}"));
            n += 1;
        }
        fs::rename(&from, &to)?;
        self.discard_working()?;
        info!(path = %to.display(), "recovered database saved");
        Ok(to)
    }

    pub fn discard_recovery(&mut self) -> io::Result<()> {
        self.recovery = None;
        remove_if_exists(&self.recovery_path())
    }

    /// Resolve a user-supplied database name to a path under the root.
    pub fn saved_path(&self, name: &str) -> SessionResult<PathBuf> {
        let name = name.trim();
        let invalid = || SessionError::InvalidName {
            name: name.to_string(),
        };
        if name.is_empty()
            || name.contains(['/', '\\'])
            || name == "."
            || name == ".."
            || name.starts_with('.')
        {
            return Err(invalid());
        }
        let file = if Path::new(name).extension().is_some_and(|e| e == DB_EXTENSION) {
            name.to_string()
        } else {
            format!("{name}.{DB_EXTENSION}")
        };
        if file == WORKING_DB || file == RECOVERY_DB {
            return Err(invalid());
        }
        Ok(self.root.join(file))
    }

    /// Path a save under `name` writes to. Refuses to clobber an existing database unless
    /// `overwrite` is set.
    pub fn check_save_target(&self, name: &str, overwrite: bool) -> SessionResult<PathBuf> {
        let path = self.saved_path(name)?;
        if path.exists() && !overwrite {
            return Err(SessionError::SaveCollision { path });
        }
        Ok(path)
    }

    /// The working content now lives in a saved database.
    pub fn finish_save(&mut self) -> io::Result<()> {
        if self.working.is_some() || self.working_path().exists() {
            debug!("removing working database after save");
        }
        self.discard_working()
    }

    pub fn rename_saved(
        &self,
        from: &str,
        to: &str,
        overwrite: bool,
        in_use: &[&Path],
    ) -> SessionResult<PathBuf> {
        let from = self.existing_saved(from)?;
        refuse_in_use(&from, in_use)?;
        let to = self.saved_path(to)?;
        if to == from {
            return Ok(to);
        }
        refuse_in_use(&to, in_use)?;
        if to.exists() && !overwrite {
            return Err(SessionError::SaveCollision { path: to });
        }
        fs::rename(&from, &to)?;
        info!(from = %from.display(), to = %to.display(), "database renamed");
        Ok(to)
    }

    pub fn delete_saved(&self, name: &str, in_use: &[&Path]) -> SessionResult<PathBuf> {
        let path = self.existing_saved(name)?;
        refuse_in_use(&path, in_use)?;
        fs::remove_file(&path)?;
        info!(path = %path.display(), "database deleted");
        Ok(path)
    }

    fn existing_saved(&self, name: &str) -> SessionResult<PathBuf> {
        let path = self.saved_path(name)?;
        if !path.is_file() {
            return Err(SessionError::NotFound { path });
        }
        Ok(path)
    }

    /// Saved databases, newest modification first.
    pub fn list_saved(&self) -> io::Result<Vec<DatabaseHandle>> {
        let mut found: Vec<(SystemTime, DatabaseHandle)> = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == WORKING_DB || name == RECOVERY_DB {
                continue;
            }
            if path.extension().map_or(true, |e| e != DB_EXTENSION) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((
                modified,
                DatabaseHandle {
                    path,
                    kind: DatabaseKind::Saved,
                    size_bytes: meta.len(),
                    in_memory: false,
                },
            ));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.path.cmp(&b.1.path)));
        Ok(found.into_iter().map(|(_, h)| h).collect())
    }

    /// Empty the export directory, creating it if needed.
    pub fn reset_export_dir(&self) -> io::Result<PathBuf> {
        let dir = self.export_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Databases the engine has open, or is about to open or write, are exclusive.
fn refuse_in_use(path: &Path, in_use: &[&Path]) -> SessionResult<()> {
    if in_use.iter().any(|p| *p == path) {
        return Err(SessionError::DatabaseInUse {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), "could not remove: {e}");
            Err(e)
        }
    }
}

/// File name for a recovered database, e.g. `240131-142501.db`.
pub fn recovery_name(now: OffsetDateTime) -> String {
    let format =
        time::macros::format_description!("[year repr:last_two][month][day]-[hour][minute][second]");
    let stamp = now
        .format(&format)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!("{stamp}.{DB_EXTENSION}")
}

/// Local time when the offset is known, UTC otherwise.
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}
