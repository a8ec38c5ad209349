//! Snapshot enumeration from the snapshot directory

use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use snapwatch_core::snapshot::{prefix_for, MAX_DISAMBIGUATOR};
use snapwatch_core::{Snapshot, SnapshotError, SnapshotName, VolumeTool, WatchTarget};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Aggregate view of the catalog
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogStats {
    pub count: usize,
    /// Sum of measured sizes; snapshots that could not be measured count as 0
    pub total_size: u64,
    pub oldest: Option<Snapshot>,
    pub newest: Option<Snapshot>,
}

/// Snapshots of one watch target
///
/// Only directories whose names parse as `<prefix>_<YYYYMMDD>_<HHMMSS>[_NNN]`
/// belong to the catalog. Anything else in the snapshot directory (other
/// targets, lock directories, operator junk) is skipped.
#[derive(Debug, Clone)]
pub struct SnapshotCatalog {
    snapshot_dir: PathBuf,
    source_path: PathBuf,
    prefix: String,
}

impl SnapshotCatalog {
    pub fn new(snapshot_dir: impl Into<PathBuf>, source_path: impl Into<PathBuf>) -> Self {
        let source_path = source_path.into();
        Self {
            prefix: prefix_for(&source_path),
            snapshot_dir: snapshot_dir.into(),
            source_path,
        }
    }

    /// Catalog for a validated target
    pub fn for_target(target: &WatchTarget) -> Self {
        Self {
            snapshot_dir: target.snapshot_dir().to_path_buf(),
            source_path: target.path().to_path_buf(),
            prefix: target.prefix().to_string(),
        }
    }

    /// All snapshots, oldest first
    ///
    /// A missing snapshot directory is an empty catalog.
    pub async fn list(&self) -> Result<Vec<Snapshot>> {
        let mut entries = match tokio::fs::read_dir(&self.snapshot_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SnapshotError::io(&self.snapshot_dir, e)),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SnapshotError::io(&self.snapshot_dir, e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(parsed) = SnapshotName::parse(&self.prefix, name) else {
                continue;
            };

            // Entry may vanish between readdir and stat (concurrent deletion)
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => {}
                Ok(_) => {
                    debug!(name, "Skipping non-directory with snapshot-like name");
                    continue;
                }
                Err(_) => continue,
            }

            snapshots.push(Snapshot::from_name(
                &parsed,
                &self.snapshot_dir,
                &self.source_path,
            ));
        }

        snapshots.sort_by(Snapshot::chronological);
        Ok(snapshots)
    }

    /// Like [`SnapshotCatalog::list`], with sizes measured by `tool`
    pub async fn list_detailed(&self, tool: &dyn VolumeTool) -> Result<Vec<Snapshot>> {
        let mut snapshots = self.list().await?;
        for snapshot in &mut snapshots {
            match tool.measure(&snapshot.path).await {
                Ok(size) => snapshot.size_bytes = Some(size),
                Err(e) => {
                    warn!(name = %snapshot.name, error = %e, "Could not measure snapshot size");
                }
            }
        }
        Ok(snapshots)
    }

    /// Look up one snapshot by directory name
    pub async fn find(&self, name: &str) -> Result<Option<Snapshot>> {
        let Some(parsed) = SnapshotName::parse(&self.prefix, name) else {
            return Ok(None);
        };
        let path = self.snapshot_dir.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(Snapshot::from_name(
                &parsed,
                &self.snapshot_dir,
                &self.source_path,
            ))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SnapshotError::io(path, e)),
        }
    }

    /// Snapshots created within `[from, to]`
    pub async fn created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>> {
        let mut snapshots = self.list().await?;
        snapshots.retain(|s| s.created_at >= from && s.created_at <= to);
        Ok(snapshots)
    }

    /// Count, total size, oldest and newest
    pub async fn stats(&self, tool: &dyn VolumeTool) -> Result<CatalogStats> {
        let snapshots = self.list_detailed(tool).await?;
        Ok(CatalogStats {
            count: snapshots.len(),
            total_size: snapshots.iter().filter_map(|s| s.size_bytes).sum(),
            oldest: snapshots.first().cloned(),
            newest: snapshots.last().cloned(),
        })
    }

    /// Name for a snapshot taken at `at`
    ///
    /// The undecorated name is used when no snapshot exists for that second;
    /// otherwise the suffix after the highest one in use, so a name freed by
    /// retention is never reused out of order. Running out of suffixes within
    /// one second is reported as a tool failure rather than overwriting
    /// anything.
    pub async fn allocate_name(&self, at: DateTime<Utc>) -> Result<SnapshotName> {
        let base = SnapshotName::new(self.prefix.clone(), at);
        let same_second: Vec<Snapshot> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.created_at == base.created_at())
            .collect();

        if same_second.is_empty() && !self.name_taken(&base).await? {
            return Ok(base);
        }

        let highest = same_second
            .iter()
            .filter_map(|s| s.disambiguator)
            .max()
            .unwrap_or(0);
        for n in (highest + 1)..=MAX_DISAMBIGUATOR {
            let candidate = base.clone().with_disambiguator(n);
            if !self.name_taken(&candidate).await? {
                debug!(name = %candidate, "Using disambiguated snapshot name");
                return Ok(candidate);
            }
        }

        Err(SnapshotError::ToolInvocation {
            operation: snapwatch_core::ToolOperation::Snapshot,
            exit_code: None,
            timed_out: false,
            detail: format!("no free snapshot name left for {}", base),
        })
    }

    async fn name_taken(&self, name: &SnapshotName) -> Result<bool> {
        let path = self.snapshot_dir.join(name.to_string());
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| SnapshotError::io(path, e))
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
