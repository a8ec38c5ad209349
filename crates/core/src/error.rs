//! Error taxonomy for snapshot scheduling
//!
//! Every component reports failures through [`SnapshotError`]. Only a startup
//! validation failure and an exhausted watch re-arm sequence stop the engine;
//! everything else is logged at the component boundary and monitoring goes on.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// External tool operation that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOperation {
    /// `subvolume show`
    Show,
    /// `subvolume snapshot`
    Snapshot,
    /// `subvolume delete`
    Delete,
    /// `filesystem du`
    Measure,
}

impl fmt::Display for ToolOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolOperation::Show => "subvolume show",
            ToolOperation::Snapshot => "subvolume snapshot",
            ToolOperation::Delete => "subvolume delete",
            ToolOperation::Measure => "filesystem du",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Watch target is missing or not a subvolume
    #[error("{} is not a valid subvolume: {reason}", .path.display())]
    Validation { path: PathBuf, reason: String },

    /// Insufficient privilege for the external tool
    #[error("permission denied during {operation}: {detail}")]
    Permission {
        operation: ToolOperation,
        detail: String,
    },

    /// Not enough space on the snapshot volume
    #[error("insufficient disk space: {detail}")]
    DiskFull { detail: String },

    /// Another snapshot operation holds the mutual-exclusion flag
    #[error("a snapshot operation is already in progress for {}", .target.display())]
    Concurrency { target: PathBuf },

    /// Non-zero exit or timeout for any other reason
    #[error("{operation} failed{}: {detail}", timeout_suffix(.timed_out))]
    ToolInvocation {
        operation: ToolOperation,
        exit_code: Option<i32>,
        timed_out: bool,
        detail: String,
    },

    /// Change notification subsystem failed
    #[error("watch failed for {}: {detail}", .path.display())]
    Watch { path: PathBuf, detail: String },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn timeout_suffix(timed_out: &bool) -> &'static str {
    if *timed_out {
        " (timed out)"
    } else {
        ""
    }
}

impl SnapshotError {
    /// Wrap an I/O error with the path it happened at
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SnapshotError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable kind, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            SnapshotError::Validation { .. } => "validation",
            SnapshotError::Permission { .. } => "permission",
            SnapshotError::DiskFull { .. } => "disk_full",
            SnapshotError::Concurrency { .. } => "concurrency",
            SnapshotError::ToolInvocation { .. } => "tool_invocation",
            SnapshotError::Watch { .. } => "watch",
            SnapshotError::Io { .. } => "io",
        }
    }

    /// Whether this failure counts as an attempt for cooldown purposes
    ///
    /// Only generic tool failures do: permission, disk and precondition
    /// failures never reached the point of touching the volume.
    pub fn counts_as_attempt(&self) -> bool {
        matches!(self, SnapshotError::ToolInvocation { .. })
    }

    /// Whether this error stops the engine when raised during startup
    ///
    /// At runtime a validation failure only skips the operation; the target
    /// is re-checked on the next trigger.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SnapshotError::Validation { .. })
    }
}
