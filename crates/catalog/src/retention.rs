//! Retention policies and enforcement

use crate::{Result, SnapshotCatalog};
use chrono::{DateTime, Utc};
use snapwatch_core::tool::bounded;
use snapwatch_core::{CleanupMode, Config, Snapshot, SnapshotError, ToolOperation, VolumeTool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Retention policy configuration
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Which rule applies
    pub mode: CleanupMode,
    /// Count mode: number of newest snapshots to keep
    pub max_count: usize,
    /// Age mode: snapshots older than this are removed
    pub max_age: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RetentionPolicy {
    fn from(config: &Config) -> Self {
        Self {
            mode: config.cleanup_mode,
            max_count: config.max_snapshots,
            max_age: config.retention_age(),
        }
    }
}

impl RetentionPolicy {
    /// Snapshots to delete, oldest first
    ///
    /// `listing` must already be in chronological order.
    pub fn select<'a>(&self, listing: &'a [Snapshot], now: DateTime<Utc>) -> Vec<&'a Snapshot> {
        match self.mode {
            CleanupMode::Count => {
                let excess = listing.len().saturating_sub(self.max_count);
                listing.iter().take(excess).collect()
            }
            CleanupMode::Time => {
                // A window reaching past the calendar start keeps everything
                match now.checked_sub_signed(self.max_age) {
                    Some(cutoff) => listing.iter().filter(|s| s.created_at < cutoff).collect(),
                    None => Vec::new(),
                }
            }
        }
    }
}

/// One deletion that did not go through
#[derive(Debug)]
pub struct RetentionFailure {
    pub name: String,
    pub error: SnapshotError,
}

/// Outcome of a retention pass
#[derive(Debug, Default)]
pub struct RetentionReport {
    /// Names removed, in deletion order
    pub deleted: Vec<String>,
    pub errors: Vec<RetentionFailure>,
}

impl RetentionReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Applies a retention policy to one target's catalog
pub struct RetentionEngine {
    catalog: SnapshotCatalog,
    tool: Arc<dyn VolumeTool>,
    timeout: Duration,
}

impl RetentionEngine {
    pub fn new(catalog: SnapshotCatalog, tool: Arc<dyn VolumeTool>, timeout: Duration) -> Self {
        Self {
            catalog,
            tool,
            timeout,
        }
    }

    /// Delete whatever `policy` rejects, oldest first
    ///
    /// Always works from a fresh listing. Individual deletion failures are
    /// recorded in the report and the pass goes on; only a failure to list
    /// the snapshot directory is returned as an error.
    pub async fn enforce(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<RetentionReport> {
        let listing = self.catalog.list().await?;
        let doomed = policy.select(&listing, now);
        let mut report = RetentionReport::default();

        for snapshot in doomed {
            match self.delete(snapshot).await {
                Ok(()) => report.deleted.push(snapshot.name.clone()),
                Err(error) => report.errors.push(RetentionFailure {
                    name: snapshot.name.clone(),
                    error,
                }),
            }
        }

        info!(
            event = "retention_completed",
            outcome = if report.is_clean() { "ok" } else { "partial" },
            mode = %policy.mode,
            kept = listing.len() - report.deleted.len(),
            deleted = report.deleted.len(),
            failed = report.errors.len(),
            "Retention pass finished"
        );

        Ok(report)
    }

    /// Delete one snapshot with the bounded tool call
    ///
    /// Also the path for an administrator removing a snapshot by name.
    pub async fn delete(&self, snapshot: &Snapshot) -> std::result::Result<(), SnapshotError> {
        info!(
            event = "deletion_attempted",
            name = %snapshot.name,
            "Deleting snapshot"
        );

        let result = bounded(
            ToolOperation::Delete,
            self.timeout,
            self.tool.delete(&snapshot.path),
        )
        .await;

        match &result {
            Ok(()) => info!(
                event = "deletion_succeeded",
                outcome = "ok",
                name = %snapshot.name,
                "Deleted snapshot"
            ),
            Err(error) => warn!(
                event = "deletion_failed",
                outcome = error.kind(),
                name = %snapshot.name,
                error = %error,
                "Failed to delete snapshot"
            ),
        }
        result
    }

    pub fn catalog(&self) -> &SnapshotCatalog {
        &self.catalog
    }
}
