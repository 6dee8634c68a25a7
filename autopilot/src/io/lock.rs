//! Single-active-session lock for a sandbox root.
//!
//! `.autopilot.lock` is created with create-new semantics; a second supervisor
//! pointed at the same root fails fast instead of corrupting the task list or
//! git state. A lock left behind by a dead process on this host is taken
//! over; anything else needs `autopilot unlock`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("project directory is already claimed by another supervisor ({holder}); lock file: {path}")]
    Conflict { path: PathBuf, holder: String },
    #[error("lock {path} is held by a live process ({holder}); pass --force to remove it anyway")]
    HolderAlive { path: PathBuf, holder: String },
    #[error("failed to acquire lock '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockMetadata {
    pub pid: u32,
    pub host: String,
    pub created_at: DateTime<Utc>,
}

impl LockMetadata {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            created_at: Utc::now(),
        }
    }

    fn read(path: &Path) -> Option<Self> {
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// True when the holder is known to be gone: same host, pid not running.
    /// Locks from other hosts are never considered stale.
    pub fn is_stale(&self) -> bool {
        self.host == LockMetadata::current().host && !process_alive(self.pid)
    }

    pub fn describe(&self) -> String {
        format!(
            "pid {} on {} since {}",
            self.pid,
            self.host,
            self.created_at.to_rfc3339()
        )
    }
}

/// RAII guard; the lock file is deleted on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(err) => warn!(path = %self.path.display(), err = %err, "failed to release lock"),
        }
    }
}

/// Claim `lock_path`, failing with [`LockError::Conflict`] if it is held.
///
/// A lock whose holder is stale (see [`LockMetadata::is_stale`]) is removed
/// and claimed once; a second collision is a real conflict.
pub fn acquire(lock_path: &Path) -> Result<LockGuard, LockError> {
    let io_err = |source| LockError::Io {
        path: lock_path.to_path_buf(),
        source,
    };
    let mut took_over = false;
    let mut file = loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => break file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = LockMetadata::read(lock_path);
                if !took_over
                    && let Some(stale) = holder.as_ref().filter(|meta| meta.is_stale())
                {
                    warn!(
                        path = %lock_path.display(),
                        holder = %stale.describe(),
                        "taking over stale lock"
                    );
                    match fs::remove_file(lock_path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(io_err(err)),
                    }
                    took_over = true;
                    continue;
                }
                return Err(LockError::Conflict {
                    path: lock_path.to_path_buf(),
                    holder: holder
                        .map(|meta| meta.describe())
                        .unwrap_or_else(|| "unknown holder".to_string()),
                });
            }
            Err(err) => return Err(io_err(err)),
        }
    };

    let guard = LockGuard {
        path: lock_path.to_path_buf(),
    };
    let json = serde_json::to_string_pretty(&LockMetadata::current())
        .map_err(|err| io_err(std::io::Error::other(err)))?;
    file.write_all(json.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    debug!(path = %lock_path.display(), "lock acquired");
    Ok(guard)
}

/// Remove `lock_path` for `autopilot unlock`.
///
/// Returns the previous holder, if the file was readable. Refuses a holder
/// that is still running on this host unless `force` is set.
pub fn clear(lock_path: &Path, force: bool) -> Result<Option<LockMetadata>, LockError> {
    if !lock_path.exists() {
        return Ok(None);
    }
    let holder = LockMetadata::read(lock_path);
    if let Some(meta) = &holder
        && !force
        && meta.host == LockMetadata::current().host
        && process_alive(meta.pid)
    {
        return Err(LockError::HolderAlive {
            path: lock_path.to_path_buf(),
            holder: meta.describe(),
        });
    }
    match fs::remove_file(lock_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(LockError::Io {
                path: lock_path.to_path_buf(),
                source,
            });
        }
    }
    debug!(path = %lock_path.display(), "lock cleared");
    Ok(holder)
}

/// Delete `lock_path` if this process holds it. Used on forced exit, where
/// the [`LockGuard`] destructor never runs.
pub fn release_if_owned(lock_path: &Path) {
    let owned = LockMetadata::read(lock_path).is_some_and(|meta| {
        meta.pid == std::process::id() && meta.host == LockMetadata::current().host
    });
    if owned && let Err(err) = fs::remove_file(lock_path) {
        warn!(path = %lock_path.display(), err = %err, "failed to release lock");
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes for existence; EPERM means it exists under another user.
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
