//! External volume tool contract
//!
//! The privileged snapshot primitive lives outside this process. Snapwatch
//! talks to it through [`VolumeTool`]:
//! - [`BtrfsTool`] shells out to `btrfs subvolume snapshot|delete|show`
//! - [`CopyTool`] does plain directory copies for test mode
//!
//! Success is decided by exit status only. stderr is kept for diagnostics and
//! a small heuristic that separates disk-full and permission failures from
//! everything else.

use crate::error::{SnapshotError, ToolOperation};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Snapshot-capable volume manager
#[async_trait]
pub trait VolumeTool: Send + Sync {
    /// Human-readable tool name for logs
    fn name(&self) -> &str;

    /// Whether `path` is a snapshot-capable subvolume
    async fn is_subvolume(&self, path: &Path) -> Result<bool, SnapshotError>;

    /// Create a snapshot of `source` at `dest`
    async fn snapshot(&self, source: &Path, dest: &Path) -> Result<(), SnapshotError>;

    /// Remove the snapshot at `path`
    async fn delete(&self, path: &Path) -> Result<(), SnapshotError>;

    /// Size of the snapshot at `path` in bytes
    async fn measure(&self, path: &Path) -> Result<u64, SnapshotError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || apparent_size(&owned))
            .await
            .map_err(|e| SnapshotError::ToolInvocation {
                operation: ToolOperation::Measure,
                exit_code: None,
                timed_out: false,
                detail: e.to_string(),
            })?
    }
}

/// Run a tool future with an upper bound on its duration
///
/// On timeout the future is dropped; for [`BtrfsTool`] that kills the child.
pub async fn bounded<T, F>(operation: ToolOperation, limit: Duration, fut: F) -> Result<T, SnapshotError>
where
    F: Future<Output = Result<T, SnapshotError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SnapshotError::ToolInvocation {
            operation,
            exit_code: None,
            timed_out: true,
            detail: format!("no result after {}s", limit.as_secs_f64()),
        }),
    }
}

/// Classify a failed tool run from its exit code and stderr
pub fn classify_failure(operation: ToolOperation, exit_code: Option<i32>, stderr: &str) -> SnapshotError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr.trim().to_string();

    if lower.contains("no space left") || lower.contains("enospc") || lower.contains("disk quota exceeded") {
        SnapshotError::DiskFull { detail }
    } else if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("eperm")
        || lower.contains("must be run as root")
    {
        SnapshotError::Permission { operation, detail }
    } else {
        SnapshotError::ToolInvocation {
            operation,
            exit_code,
            timed_out: false,
            detail: if detail.is_empty() {
                format!("exit code {}", exit_code.map_or("unknown".to_string(), |c| c.to_string()))
            } else {
                detail
            },
        }
    }
}

/// `btrfs`-style command line tool
pub struct BtrfsTool {
    program: PathBuf,
}

impl BtrfsTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, operation: ToolOperation, args: &[&OsStr]) -> Result<std::process::Output, SnapshotError> {
        debug!(program = %self.program.display(), ?args, "Invoking volume tool");

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => SnapshotError::Permission {
                    operation,
                    detail: e.to_string(),
                },
                ErrorKind::NotFound => SnapshotError::ToolInvocation {
                    operation,
                    exit_code: None,
                    timed_out: false,
                    detail: format!("{} not found: is the volume tool installed?", self.program.display()),
                },
                _ => SnapshotError::ToolInvocation {
                    operation,
                    exit_code: None,
                    timed_out: false,
                    detail: e.to_string(),
                },
            })?;

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(operation, output.status.code(), &stderr))
        }
    }
}

#[async_trait]
impl VolumeTool for BtrfsTool {
    fn name(&self) -> &str {
        "btrfs"
    }

    async fn is_subvolume(&self, path: &Path) -> Result<bool, SnapshotError> {
        match self
            .run(ToolOperation::Show, &[OsStr::new("subvolume"), OsStr::new("show"), path.as_os_str()])
            .await
        {
            Ok(_) => Ok(true),
            Err(e @ SnapshotError::Permission { .. }) => Err(e),
            Err(SnapshotError::ToolInvocation { exit_code: None, detail, .. }) => {
                Err(SnapshotError::Validation {
                    path: path.to_path_buf(),
                    reason: detail,
                })
            }
            Err(_) => Ok(false),
        }
    }

    async fn snapshot(&self, source: &Path, dest: &Path) -> Result<(), SnapshotError> {
        self.run(
            ToolOperation::Snapshot,
            &[
                OsStr::new("subvolume"),
                OsStr::new("snapshot"),
                source.as_os_str(),
                dest.as_os_str(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn delete(&self, path: &Path) -> Result<(), SnapshotError> {
        self.run(
            ToolOperation::Delete,
            &[OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()],
        )
        .await
        .map(|_| ())
    }

    async fn measure(&self, path: &Path) -> Result<u64, SnapshotError> {
        let result = self
            .run(
                ToolOperation::Measure,
                &[
                    OsStr::new("filesystem"),
                    OsStr::new("du"),
                    OsStr::new("-s"),
                    OsStr::new("--raw"),
                    path.as_os_str(),
                ],
            )
            .await;

        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let Some(total) = parse_du_total(&stdout) {
                    return Ok(total);
                }
                debug!(path = %path.display(), "Unparseable du output, walking directory");
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "du failed, walking directory");
            }
        }

        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || apparent_size(&owned))
            .await
            .map_err(|e| SnapshotError::ToolInvocation {
                operation: ToolOperation::Measure,
                exit_code: None,
                timed_out: false,
                detail: e.to_string(),
            })?
    }
}

/// Parse the "Total" column of `btrfs filesystem du -s --raw`
fn parse_du_total(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

/// Plain directory copy for environments without a volume manager
///
/// Anything under `exclude` is skipped while copying, so a snapshot directory
/// nested inside the watched tree is never copied into itself.
pub struct CopyTool {
    exclude: Vec<PathBuf>,
}

impl CopyTool {
    pub fn new(exclude: Vec<PathBuf>) -> Self {
        Self { exclude }
    }
}

#[async_trait]
impl VolumeTool for CopyTool {
    fn name(&self) -> &str {
        "copy"
    }

    async fn is_subvolume(&self, path: &Path) -> Result<bool, SnapshotError> {
        Ok(tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn snapshot(&self, source: &Path, dest: &Path) -> Result<(), SnapshotError> {
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        let exclude = self.exclude.clone();

        tokio::task::spawn_blocking(move || copy_tree(&source, &dest, &exclude))
            .await
            .map_err(|e| SnapshotError::ToolInvocation {
                operation: ToolOperation::Snapshot,
                exit_code: None,
                timed_out: false,
                detail: e.to_string(),
            })?
            .map_err(|e| io_failure(ToolOperation::Snapshot, e))
    }

    async fn delete(&self, path: &Path) -> Result<(), SnapshotError> {
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| io_failure(ToolOperation::Delete, e))
    }
}

fn io_failure(operation: ToolOperation, e: std::io::Error) -> SnapshotError {
    match e.kind() {
        ErrorKind::PermissionDenied => SnapshotError::Permission {
            operation,
            detail: e.to_string(),
        },
        // ENOSPC
        _ if e.raw_os_error() == Some(28) => SnapshotError::DiskFull {
            detail: e.to_string(),
        },
        _ => SnapshotError::ToolInvocation {
            operation,
            exit_code: None,
            timed_out: false,
            detail: e.to_string(),
        },
    }
}

/// Copy a directory tree, refusing to overwrite an existing destination
fn copy_tree(source: &Path, dest: &Path, exclude: &[PathBuf]) -> std::io::Result<()> {
    if dest.exists() {
        return Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{} already exists", dest.display()),
        ));
    }
    std::fs::create_dir_all(dest)?;

    let walker = WalkDir::new(source)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !exclude.iter().any(|x| e.path().starts_with(x)));

    for entry in walker {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| std::io::Error::new(ErrorKind::Other, "walk failed"))
        })?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = std::fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            }
        }
    }
    Ok(())
}

/// Sum of file sizes under `path`
pub fn apparent_size(path: &Path) -> Result<u64, SnapshotError> {
    if !path.exists() {
        return Ok(0);
    }

    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry while measuring");
                continue;
            }
        };
        if entry.file_type().is_file() {
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Bytes available to unprivileged writers on the volume holding `path`
pub fn available_space(path: &Path) -> Result<u64, SnapshotError> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|errno| SnapshotError::io(path, std::io::Error::from(errno)))?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}
