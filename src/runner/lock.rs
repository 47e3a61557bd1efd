//! Process Lock: single active writer per project.
//!
//! The lock is a small JSON record (`pid`, `host`, `acquired_at`). It is
//! published by writing a private temp file and hard-linking it to the lock
//! path, which fails atomically when a lock already exists, so acquisition
//! never blocks and two live owners can never both succeed.
//!
//! A lock whose owner process is gone is stale and is cleared before retrying.
//! Clearing and release happen under an exclusive flock on a sidecar
//! `.guard` file, and the record is re-read under it, so a lock that another
//! contender published in the meantime is never removed.
//! Locks recorded on another host are never probed and always count as live.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TreesumError};

/// Acquisition attempts: the first, plus one after clearing a stale lock.
const ACQUIRE_ATTEMPTS: usize = 2;

/// Distinguishes temp files of concurrent attempts within one process.
static PUBLISH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    /// Record describing the calling process, stamped now.
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: current_host(),
            acquired_at: Utc::now(),
        }
    }

    /// Whether the recorded owner may still be running.
    #[must_use]
    pub fn is_owner_alive(&self) -> bool {
        if self.host != current_host() {
            return true;
        }
        if self.pid == std::process::id() {
            return true;
        }
        pid_alive(self.pid)
    }
}

/// What is currently at a lock path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held { record: LockRecord, alive: bool },
    /// The file exists but is not a readable lock record.
    Corrupt,
}

/// Inspect a lock path without touching it.
pub fn inspect(path: &Path) -> Result<LockState> {
    Ok(match read_record(path)? {
        ReadOutcome::Missing => LockState::Free,
        ReadOutcome::Corrupt => LockState::Corrupt,
        ReadOutcome::Record(record) => {
            let alive = record.is_owner_alive();
            LockState::Held { record, alive }
        }
    })
}

/// A held lock. Released explicitly or on drop; release is idempotent.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    record: LockRecord,
    released: AtomicBool,
    cleared_stale: Option<LockRecord>,
}

impl ProcessLock {
    /// Acquire the lock at `path` or fail fast with the live owner's identity.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| TreesumError::io(parent, e))?;
        }

        let record = LockRecord::current();
        let mut cleared_stale = None;

        for _ in 0..ACQUIRE_ATTEMPTS {
            if publish(path, &record)? {
                return Ok(Self {
                    path: path.to_path_buf(),
                    record,
                    released: AtomicBool::new(false),
                    cleared_stale,
                });
            }

            match read_record(path)? {
                // Vanished between our publish attempt and the read.
                ReadOutcome::Missing => {}
                ReadOutcome::Corrupt => {
                    if clear_if_unchanged(path, &ReadOutcome::Corrupt)? {
                        eprintln!(
                            "[TSM-LOCK] cleared unreadable lock file {}",
                            path.display()
                        );
                    }
                }
                ReadOutcome::Record(existing) => {
                    if existing.is_owner_alive() {
                        return Err(contention(&existing));
                    }
                    if clear_if_unchanged(path, &ReadOutcome::Record(existing.clone()))? {
                        cleared_stale = Some(existing);
                    }
                }
            }
        }

        match read_record(path)? {
            ReadOutcome::Record(existing) => Err(contention(&existing)),
            _ => Err(TreesumError::Runtime {
                details: format!("could not acquire lock at {}", path.display()),
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// The dead owner's record if acquiring had to clear a stale lock.
    #[must_use]
    pub fn cleared_stale(&self) -> Option<&LockRecord> {
        self.cleared_stale.as_ref()
    }

    /// Remove the lock file if it still records this owner.
    ///
    /// Returns `Ok(true)` when the file was removed by this call. A lock file
    /// that now belongs to someone else is left alone.
    pub fn release(&self) -> Result<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let _guard = lock_guard(&self.path)?;
        match read_record(&self.path)? {
            ReadOutcome::Record(on_disk) if on_disk == self.record => {
                remove_lock_file(&self.path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            eprintln!("[TSM-LOCK] failed to release {}: {e}", self.path.display());
        }
    }
}

// ──────────────────── file plumbing ────────────────────

#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Missing,
    Corrupt,
    Record(LockRecord),
}

fn read_record(path: &Path) -> Result<ReadOutcome> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
        Err(e) => return Err(TreesumError::io(path, e)),
    };
    Ok(serde_json::from_slice(&raw).map_or(ReadOutcome::Corrupt, ReadOutcome::Record))
}

/// Remove the lock file only if it still holds what the caller judged
/// removable. The re-read and the removal both happen under the guard flock.
fn clear_if_unchanged(path: &Path, judged: &ReadOutcome) -> Result<bool> {
    let _guard = lock_guard(path)?;
    let still_removable = match (read_record(path)?, judged) {
        (ReadOutcome::Corrupt, ReadOutcome::Corrupt) => true,
        (ReadOutcome::Record(now), ReadOutcome::Record(then)) => {
            now == *then && !now.is_owner_alive()
        }
        _ => false,
    };
    if still_removable {
        remove_lock_file(path)?;
    }
    Ok(still_removable)
}

/// Sidecar file whose flock serializes every removal of the lock file.
fn guard_path(path: &Path) -> PathBuf {
    path.with_extension("guard")
}

#[cfg(unix)]
fn lock_guard(path: &Path) -> Result<nix::fcntl::Flock<std::fs::File>> {
    use std::os::unix::fs::OpenOptionsExt as _;

    let guard = guard_path(path);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(&guard)
        .map_err(|e| TreesumError::io(&guard, e))?;
    #[allow(deprecated)]
    nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive).map_err(|(_file, e)| {
        TreesumError::Runtime {
            details: format!("failed to lock {}: {e}", guard.display()),
        }
    })
}

/// No advisory locking here; takeover falls back to the re-read alone.
#[cfg(not(unix))]
fn lock_guard(_path: &Path) -> Result<()> {
    Ok(())
}

/// Try to create the lock file. `Ok(false)` when one already exists.
fn publish(path: &Path, record: &LockRecord) -> Result<bool> {
    let temp = path.with_extension(format!(
        "{}.{}.tmp",
        record.pid,
        PUBLISH_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let body = serde_json::to_vec_pretty(record)?;
    {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        let mut file = opts.open(&temp).map_err(|e| TreesumError::io(&temp, e))?;
        file.write_all(&body)
            .and_then(|()| file.sync_all())
            .map_err(|e| TreesumError::io(&temp, e))?;
    }

    let linked = fs::hard_link(&temp, path);
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(TreesumError::io(path, e)),
    }
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TreesumError::io(path, e)),
    }
}

fn contention(owner: &LockRecord) -> TreesumError {
    TreesumError::LockContention {
        owner_pid: owner.pid,
        host: owner.host.clone(),
        since: owner.acquired_at.to_rfc3339(),
    }
}

// ──────────────────── process identity ────────────────────

#[cfg(unix)]
fn current_host() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(unix))]
fn current_host() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Signal-0 probe. EPERM means the process exists under another user.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
