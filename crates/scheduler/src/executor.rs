//! Snapshot creation under mutual exclusion

use crate::cooldown::CooldownGate;
use crate::engine::{prepare_target, EngineError, EngineOptions};
use crate::state::{EngineState, OperationGuard, SharedState};
use catalog::{RetentionEngine, RetentionPolicy, RetentionReport, SnapshotCatalog};
use chrono::Utc;
use snapwatch_core::tool::{available_space, bounded};
use snapwatch_core::{Config, Snapshot, SnapshotError, ToolOperation, VolumeTool, WatchTarget};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use watcher::DebounceAggregator;

type Result<T> = std::result::Result<T, SnapshotError>;

/// Creates snapshots of one target and applies retention after each success
///
/// Every operation first claims the target's `in_progress` flag. A second
/// caller fails immediately with [`SnapshotError::Concurrency`] instead of
/// queuing.
pub struct SnapshotExecutor {
    target: Arc<WatchTarget>,
    catalog: SnapshotCatalog,
    retention: RetentionEngine,
    policy: RetentionPolicy,
    tool: Arc<dyn VolumeTool>,
    shared: Arc<SharedState>,
    tool_timeout: Duration,
    min_free_bytes: u64,
}

impl SnapshotExecutor {
    pub fn new(
        target: Arc<WatchTarget>,
        tool: Arc<dyn VolumeTool>,
        shared: Arc<SharedState>,
        options: &EngineOptions,
    ) -> Self {
        let catalog = SnapshotCatalog::for_target(&target);
        let retention = RetentionEngine::new(catalog.clone(), Arc::clone(&tool), options.tool_timeout);
        Self {
            target,
            catalog,
            retention,
            policy: options.retention.clone(),
            tool,
            shared,
            tool_timeout: options.tool_timeout,
            min_free_bytes: options.min_free_bytes,
        }
    }

    /// Executor for one-shot commands outside a running engine
    pub async fn from_config(config: &Config) -> std::result::Result<Self, EngineError> {
        let (target, tool) = prepare_target(config).await?;
        let options = EngineOptions::from(config);
        let shared = SharedState::new(EngineState::new(
            DebounceAggregator::new(options.debounce, options.max_batch_age),
            CooldownGate::new(options.cooldown),
        ));
        Ok(Self::new(Arc::new(target), tool, shared, &options))
    }

    /// Claim the mutual-exclusion flag
    pub fn try_begin(&self) -> Result<OperationGuard> {
        self.shared.try_begin().ok_or_else(|| SnapshotError::Concurrency {
            target: self.target.path().to_path_buf(),
        })
    }

    /// Create one snapshot, then enforce retention
    pub async fn create(&self, description: Option<String>) -> Result<Snapshot> {
        let guard = match self.try_begin() {
            Ok(guard) => guard,
            Err(e) => {
                info!(
                    event = "snapshot_skipped",
                    outcome = e.kind(),
                    path = %self.target.path().display(),
                    "Snapshot already in progress, request dropped"
                );
                return Err(e);
            }
        };
        self.create_with(guard, description).await
    }

    /// Create one snapshot with an already claimed flag
    ///
    /// The flag is released when `guard` drops at the end, on every path.
    pub async fn create_with(&self, guard: OperationGuard, description: Option<String>) -> Result<Snapshot> {
        let result = self.create_locked(description).await;

        match &result {
            Ok(snapshot) => {
                {
                    let mut state = self.shared.lock();
                    state.last_snapshot_at = Some(Instant::now());
                    state.last_snapshot_wall = Some(Utc::now());
                    state.snapshots_created += 1;
                }
                info!(
                    event = "snapshot_succeeded",
                    outcome = "ok",
                    name = %snapshot.name,
                    path = %snapshot.path.display(),
                    "Snapshot created"
                );

                if let Err(e) = self.retain_locked().await {
                    warn!(error = %e, "Retention after snapshot failed");
                }
            }
            Err(e) => {
                {
                    let mut state = self.shared.lock();
                    state.snapshots_failed += 1;
                    if e.counts_as_attempt() {
                        state.last_failed_attempt_at = Some(Instant::now());
                    }
                }
                warn!(
                    event = "snapshot_failed",
                    outcome = e.kind(),
                    path = %self.target.path().display(),
                    error = %e,
                    "Snapshot failed"
                );

                if matches!(e, SnapshotError::ToolInvocation { .. }) {
                    self.target.revalidate(self.tool.as_ref(), self.tool_timeout).await;
                }
            }
        }

        drop(guard);
        result
    }

    /// One retention pass under the mutual-exclusion flag
    pub async fn enforce_retention(&self) -> Result<RetentionReport> {
        let _guard = self.try_begin()?;
        self.retain_locked().await
    }

    async fn retain_locked(&self) -> Result<RetentionReport> {
        self.retention.enforce(&self.policy, Utc::now()).await
    }

    async fn create_locked(&self, description: Option<String>) -> Result<Snapshot> {
        self.check_target().await?;
        self.check_destination().await?;

        let name = self.catalog.allocate_name(Utc::now()).await?;
        let mut snapshot = Snapshot::from_name(&name, self.target.snapshot_dir(), self.target.path());
        snapshot.description = description;

        info!(
            event = "snapshot_attempted",
            name = %snapshot.name,
            source = %self.target.path().display(),
            description = snapshot.description.as_deref().unwrap_or(""),
            "Creating snapshot"
        );

        bounded(
            ToolOperation::Snapshot,
            self.tool_timeout,
            self.tool.snapshot(self.target.path(), &snapshot.path),
        )
        .await?;

        let exists = tokio::fs::try_exists(&snapshot.path)
            .await
            .map_err(|e| SnapshotError::io(&snapshot.path, e))?;
        if !exists {
            return Err(SnapshotError::ToolInvocation {
                operation: ToolOperation::Snapshot,
                exit_code: Some(0),
                timed_out: false,
                detail: format!(
                    "tool reported success but {} does not exist",
                    snapshot.path.display()
                ),
            });
        }

        Ok(snapshot)
    }

    /// Target must still be a subvolume
    async fn check_target(&self) -> Result<()> {
        if self.target.is_valid() || self.target.revalidate(self.tool.as_ref(), self.tool_timeout).await {
            return Ok(());
        }
        Err(SnapshotError::Validation {
            path: self.target.path().to_path_buf(),
            reason: format!("no longer a {} subvolume", self.tool.name()),
        })
    }

    /// Snapshot directory must exist and have room
    async fn check_destination(&self) -> Result<()> {
        let dir = self.target.snapshot_dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SnapshotError::io(dir, e))?;

        if self.min_free_bytes == 0 {
            return Ok(());
        }
        match available_space(dir) {
            Ok(free) if free < self.min_free_bytes => Err(SnapshotError::DiskFull {
                detail: format!(
                    "{} bytes free on {}, {} required",
                    free,
                    dir.display(),
                    self.min_free_bytes
                ),
            }),
            Ok(free) => {
                debug!(free, "Free space check passed");
                Ok(())
            }
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Could not determine free space, continuing");
                Ok(())
            }
        }
    }

    pub fn target(&self) -> &Arc<WatchTarget> {
        &self.target
    }

    pub fn catalog(&self) -> &SnapshotCatalog {
        &self.catalog
    }
}
