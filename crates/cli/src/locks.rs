//! Lock file management for snapshot directory exclusivity
//!
//! The daemon and the mutating one-shot commands (`snapshot`, `cleanup`) take
//! the same lock, so they never operate on one snapshot directory at once.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Lock path relative to the snapshot directory
pub const LOCK_FILE: &str = ".snapwatch/daemon.lock";

/// Held lock; released and removed on drop
pub struct DaemonLock {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

/// Lock file content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl DaemonLock {
    /// Acquire the exclusive lock for `snapshot_dir`
    ///
    /// Returns error if:
    /// - Another process holds the flock (whatever the file content says)
    /// - Permission denied
    ///
    /// A leftover file from a crashed holder carries no flock and is simply
    /// reused.
    pub fn acquire(snapshot_dir: &Path) -> Result<Self> {
        let lock_path = snapshot_dir.join(LOCK_FILE);

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // The holder may unlink the file between our open and our flock
        for _ in 0..3 {
            let mut file = open_lock_file(&lock_path)?;

            if !try_flock_exclusive(&file)? {
                match read_holder(&mut file) {
                    Ok(holder) => anyhow::bail!(
                        "Snapshot directory {} is locked by process {} (running since {})",
                        snapshot_dir.display(),
                        holder.pid,
                        holder.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    Err(_) => anyhow::bail!(
                        "Snapshot directory {} is locked by another process",
                        snapshot_dir.display()
                    ),
                }
            }

            if !is_same_file(&file, &lock_path) {
                continue;
            }
            write_holder(&mut file)?;
            return Ok(Self {
                path: lock_path,
                file,
            });
        }

        anyhow::bail!("Could not acquire lock {}", lock_path.display())
    }

    /// Release the lock and remove the lock file
    pub fn release(self) -> Result<()> {
        std::fs::remove_file(&self.path).context("Failed to remove lock file")?;
        Ok(())
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Process currently holding the lock for `snapshot_dir`, if any
pub fn holder(snapshot_dir: &Path) -> Result<Option<LockHolder>> {
    let lock_path = snapshot_dir.join(LOCK_FILE);
    let mut file = match OpenOptions::new().read(true).open(&lock_path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("Failed to open lock file"),
    };

    // Content is empty while a holder is starting up
    match read_holder(&mut file) {
        Ok(holder) if is_process_alive(holder.pid) => Ok(Some(holder)),
        _ => Ok(None),
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))
}

fn write_holder(file: &mut File) -> Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        started_at: Utc::now(),
    };
    let serialized = serde_json::to_string(&holder).context("Failed to serialize lock content")?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_holder(file: &mut File) -> Result<LockHolder> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).context("Failed to deserialize lock content")
}

/// Whether the open lock file is still the one at `path`
fn is_same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(open), Ok(current)) => open.dev() == current.dev() && open.ino() == current.ino(),
        _ => false,
    }
}

/// Try to acquire an exclusive file lock (non-blocking)
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Null signal probe: existence check without delivering anything
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // EPERM: exists but owned by someone else
        Err(_) => true,
    }
}
