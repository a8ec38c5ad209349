//! Watch target validation

use crate::error::{SnapshotError, ToolOperation};
use crate::snapshot::prefix_for;
use crate::tool::{bounded, VolumeTool};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// The monitored subvolume plus its validation status
///
/// The path never changes after construction. The status flag is set at
/// startup and flipped by [`WatchTarget::revalidate`] after a failure.
#[derive(Debug)]
pub struct WatchTarget {
    path: PathBuf,
    snapshot_dir: PathBuf,
    prefix: String,
    valid: AtomicBool,
}

impl WatchTarget {
    /// Validate `path` as a subvolume and build the target
    ///
    /// Fails with [`SnapshotError::Validation`] when the path is missing, not a
    /// directory, or not a subvolume according to `tool`. The tool check is
    /// bounded by `limit`.
    pub async fn validate(
        path: &Path,
        snapshot_dir: &Path,
        tool: &dyn VolumeTool,
        limit: Duration,
    ) -> Result<Self, SnapshotError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| SnapshotError::Validation {
                path: path.to_path_buf(),
                reason: format!("watch directory does not exist: {}", e),
            })?;
        if !meta.is_dir() {
            return Err(SnapshotError::Validation {
                path: path.to_path_buf(),
                reason: "watch path is not a directory".to_string(),
            });
        }

        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| SnapshotError::io(path, e))?;

        if !bounded(ToolOperation::Show, limit, tool.is_subvolume(&canonical)).await? {
            return Err(SnapshotError::Validation {
                path: canonical,
                reason: format!("not a {} subvolume", tool.name()),
            });
        }

        info!(path = %canonical.display(), tool = tool.name(), "Watch target validated");
        Ok(Self::trusted(canonical, snapshot_dir.to_path_buf()))
    }

    /// Build a target that is already known to be valid
    pub fn trusted(path: PathBuf, snapshot_dir: PathBuf) -> Self {
        Self {
            prefix: prefix_for(&path),
            path,
            snapshot_dir,
            valid: AtomicBool::new(true),
        }
    }

    /// Re-check subvolume status, updating the flag
    ///
    /// A check that errors or outlives `limit` counts as invalid.
    pub async fn revalidate(&self, tool: &dyn VolumeTool, limit: Duration) -> bool {
        let valid = match bounded(ToolOperation::Show, limit, tool.is_subvolume(&self.path)).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Subvolume re-check failed");
                false
            }
        };
        let was = self.valid.swap(valid, Ordering::SeqCst);
        if was != valid {
            info!(path = %self.path.display(), valid, "Watch target status changed");
        }
        valid
    }

    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Name prefix of this target's snapshots (the watch dir basename)
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
