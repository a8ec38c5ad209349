//! Coordinating engine
//!
//! A single task owns the change channel and makes every scheduling
//! decision: it feeds events into the debounce aggregator, offers fired
//! batches to the cooldown gate and hands forwarded triggers to the executor.
//! Timers are plain deadlines stored in [`EngineState`]; the task sleeps until
//! the earliest one, so re-arming a timer is just overwriting a deadline and a
//! stale timer can never fire twice.
//!
//! Snapshot creation runs in its own task holding the mutual-exclusion flag,
//! so the coordinator keeps draining events while the tool works.

use crate::cooldown::{CooldownGate, GateDecision};
use crate::executor::SnapshotExecutor;
use crate::state::{EngineState, SharedState};
use catalog::{RetentionPolicy, RetentionReport, SnapshotCatalog};
use chrono::{DateTime, Utc};
use snapwatch_core::{BtrfsTool, Config, CopyTool, Snapshot, SnapshotError, VolumeTool, WatchTarget};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use watcher::{
    ChangeEvent, ChangeKind, ChangeSource, DebounceAggregator, IgnoreConfig, IgnoreRules, NotifySource,
    WatchMessage,
};

/// Fatal engine failures
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("watch target rejected: {0}")]
    Validation(#[source] SnapshotError),

    #[error("could not start watching: {0}")]
    WatchStart(#[source] SnapshotError),

    #[error("watch on {} lost, gave up after {attempts} re-arm attempts: {last}", .path.display())]
    WatchExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        last: SnapshotError,
    },

    #[error("invalid exclude pattern: {0}")]
    Ignore(String),

    #[error("engine task failed: {0}")]
    Crashed(String),
}

/// Tunables for one engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub debounce: Duration,
    pub max_batch_age: Duration,
    pub cooldown: Duration,
    pub tool_timeout: Duration,
    pub min_free_bytes: u64,
    pub watch_retry_attempts: u32,
    pub watch_retry_backoff: Duration,
    /// How long shutdown waits for an in-flight operation
    pub shutdown_grace: Duration,
    pub retention: RetentionPolicy,
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce(),
            max_batch_age: config.max_batch_age(),
            cooldown: config.cooldown(),
            tool_timeout: config.tool_timeout(),
            min_free_bytes: config.min_free_bytes,
            watch_retry_attempts: config.watch_retry_attempts,
            watch_retry_backoff: config.watch_retry_backoff(),
            shutdown_grace: config.tool_timeout() + Duration::from_secs(5),
            retention: RetentionPolicy::from(config),
        }
    }
}

/// Point-in-time view of the engine
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub in_progress: bool,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub pending_events: usize,
    pub debounce_deadline: Option<Instant>,
    pub cooldown_deferred_until: Option<Instant>,
    pub snapshots_created: u64,
    pub snapshots_failed: u64,
    pub dropped_triggers: u64,
    pub target_valid: bool,
}

/// Engine for one watch target, not yet running
pub struct Engine {
    target: Arc<WatchTarget>,
    tool: Arc<dyn VolumeTool>,
    source: Box<dyn ChangeSource>,
    options: EngineOptions,
}

impl Engine {
    pub fn new(
        target: WatchTarget,
        tool: Arc<dyn VolumeTool>,
        source: Box<dyn ChangeSource>,
        options: EngineOptions,
    ) -> Self {
        Self {
            target: Arc::new(target),
            tool,
            source,
            options,
        }
    }

    /// Production engine: picks the tool, validates the target and builds
    /// the notify-backed watcher
    pub async fn from_config(config: &Config) -> Result<Self, EngineError> {
        let (target, tool) = prepare_target(config).await?;
        let snapshot_dir = target.snapshot_dir().to_path_buf();

        if snapshot_dir.starts_with(target.path()) {
            warn!(
                snapshot_dir = %snapshot_dir.display(),
                "Snapshot directory is inside the watched tree; its changes are ignored"
            );
        }

        let rules = IgnoreRules::new(
            target.path(),
            IgnoreConfig {
                exclude_dirs: vec![snapshot_dir],
                use_builtin: true,
                patterns: config.exclude_patterns.clone(),
            },
        )
        .map_err(|e| EngineError::Ignore(e.to_string()))?;
        let source = NotifySource::new(target.path().to_path_buf(), rules);

        Ok(Self::new(target, tool, Box::new(source), EngineOptions::from(config)))
    }

    /// Subscribe to changes and spawn the coordinator
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(mut self) -> Result<EngineHandle, EngineError> {
        let rx = self.source.arm().map_err(EngineError::WatchStart)?;

        let shared = SharedState::new(EngineState::new(
            DebounceAggregator::new(self.options.debounce, self.options.max_batch_age),
            CooldownGate::new(self.options.cooldown),
        ));
        let executor = Arc::new(SnapshotExecutor::new(
            Arc::clone(&self.target),
            Arc::clone(&self.tool),
            Arc::clone(&shared),
            &self.options,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            path = %self.target.path().display(),
            snapshot_dir = %self.target.snapshot_dir().display(),
            tool = self.tool.name(),
            debounce_secs = self.options.debounce.as_secs(),
            cooldown_secs = self.options.cooldown.as_secs(),
            "Snapshot engine started"
        );

        let coordinator = Coordinator {
            root: self.target.path().to_path_buf(),
            source: self.source,
            shared: Arc::clone(&shared),
            executor: Arc::clone(&executor),
            options: self.options,
            shutdown: shutdown_rx,
            pending_description: None,
        };
        let task = tokio::spawn(coordinator.run(rx));

        Ok(EngineHandle {
            shared,
            executor,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }
}

/// Volume tool for `config`: plain copies in test mode, btrfs otherwise
///
/// The copy tool skips `snapshot_dir` so a nested snapshot directory is not
/// copied into itself.
pub fn volume_tool(config: &Config, snapshot_dir: &Path) -> Arc<dyn VolumeTool> {
    if config.test_mode {
        info!("Test mode: snapshots are plain directory copies");
        Arc::new(CopyTool::new(vec![snapshot_dir.to_path_buf()]))
    } else {
        Arc::new(BtrfsTool::new(&config.tool_path))
    }
}

/// Create the snapshot directory and validate the watch target
pub async fn prepare_target(config: &Config) -> Result<(WatchTarget, Arc<dyn VolumeTool>), EngineError> {
    tokio::fs::create_dir_all(&config.snapshot_dir)
        .await
        .map_err(|e| EngineError::Validation(SnapshotError::io(&config.snapshot_dir, e)))?;
    let snapshot_dir = tokio::fs::canonicalize(&config.snapshot_dir)
        .await
        .map_err(|e| EngineError::Validation(SnapshotError::io(&config.snapshot_dir, e)))?;

    let tool = volume_tool(config, &snapshot_dir);
    let target = WatchTarget::validate(&config.watch_dir, &snapshot_dir, tool.as_ref(), config.tool_timeout())
        .await
        .map_err(EngineError::Validation)?;
    Ok((target, tool))
}

/// Control surface of a running engine
pub struct EngineHandle {
    shared: Arc<SharedState>,
    executor: Arc<SnapshotExecutor>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), EngineError>>>,
}

impl EngineHandle {
    /// Manual snapshot: skips the cooldown gate, not mutual exclusion
    pub async fn snapshot_now(&self, description: Option<String>) -> Result<Snapshot, SnapshotError> {
        self.executor.create(description).await
    }

    /// One retention pass under the mutual-exclusion flag
    pub async fn enforce_retention(&self) -> Result<RetentionReport, SnapshotError> {
        self.executor.enforce_retention().await
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.shared.lock();
        EngineStatus {
            in_progress: state.in_progress,
            last_snapshot_at: state.last_snapshot_wall,
            pending_events: state.debounce.pending_events(),
            debounce_deadline: state.debounce.deadline(),
            cooldown_deferred_until: state.cooldown.deadline(),
            snapshots_created: state.snapshots_created,
            snapshots_failed: state.snapshots_failed,
            dropped_triggers: state.dropped_triggers,
            target_valid: self.executor.target().is_valid(),
        }
    }

    pub fn catalog(&self) -> &SnapshotCatalog {
        self.executor.catalog()
    }

    pub fn executor(&self) -> Arc<SnapshotExecutor> {
        Arc::clone(&self.executor)
    }

    /// Resolve when the coordinator exits; `Err` only for fatal failures
    ///
    /// Cancel-safe, so it can sit in a `select!` next to a signal handler.
    pub async fn wait(&mut self) -> Result<(), EngineError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        match joined {
            Ok(result) => result,
            Err(e) => Err(EngineError::Crashed(e.to_string())),
        }
    }

    /// Stop watching, cancel timers and wait for in-flight work
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        info!("Shutting down snapshot engine");
        // Coordinator may already be gone after a fatal error
        let _ = self.shutdown.send(true);
        self.wait().await
    }
}

struct Coordinator {
    root: PathBuf,
    source: Box<dyn ChangeSource>,
    shared: Arc<SharedState>,
    executor: Arc<SnapshotExecutor>,
    options: EngineOptions,
    shutdown: watch::Receiver<bool>,
    /// Description of the latest fired batch, used by the next creation
    pending_description: Option<String>,
}

impl Coordinator {
    async fn run(mut self, rx: mpsc::Receiver<WatchMessage>) -> Result<(), EngineError> {
        let result = self.event_loop(rx).await;
        if let Err(ref e) = result {
            error!(error = %e, "Snapshot engine stopping on fatal error");
        }
        self.stop().await;
        result
    }

    async fn event_loop(&mut self, mut rx: mpsc::Receiver<WatchMessage>) -> Result<(), EngineError> {
        loop {
            let (debounce_at, cooldown_at, retry) = self.deadlines();

            // Timers before the channel so a flood of events cannot starve them
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => return Ok(()),

                _ = sleep_until_opt(debounce_at) => self.on_debounce_due(),

                _ = sleep_until_opt(cooldown_at) => self.on_cooldown_due(),

                _ = self.shared.wait_idle(), if retry => self.on_idle(),

                message = rx.recv() => {
                    let failure = match message {
                        Some(WatchMessage::Change(event)) => {
                            self.on_change(event);
                            continue;
                        }
                        Some(WatchMessage::Failed(e)) => e,
                        None => SnapshotError::Watch {
                            path: self.root.clone(),
                            detail: "change channel closed".to_string(),
                        },
                    };
                    match self.rearm(rx, failure).await? {
                        Some(new_rx) => rx = new_rx,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Debounce and cooldown deadlines plus the idle-retry flag
    fn deadlines(&self) -> (Option<Instant>, Option<Instant>, bool) {
        let state = self.shared.lock();
        (
            state.debounce.deadline(),
            state.cooldown.deadline(),
            state.retry_when_idle,
        )
    }

    fn on_change(&mut self, event: ChangeEvent) {
        debug!(
            event = "change_received",
            path = %event.path.display(),
            kind = event.kind.as_str(),
            "Change received"
        );
        self.shared.lock().debounce.push(event, Instant::now());
    }

    fn on_debounce_due(&mut self) {
        let batch = self.shared.lock().debounce.poll(Instant::now());
        let Some(batch) = batch else {
            return;
        };

        info!(
            event = "batch_fired",
            outcome = if batch.forced() { "max_age" } else { "quiet" },
            events = batch.event_count(),
            paths = batch.unique_paths(),
            "Change batch settled"
        );
        self.pending_description = Some(batch.describe());
        self.offer();
    }

    fn on_cooldown_due(&mut self) {
        let due = self.shared.lock().cooldown.take_due(Instant::now());
        if due {
            self.offer();
        }
    }

    fn on_idle(&mut self) {
        self.shared.lock().retry_when_idle = false;
        debug!("Executor idle, retrying dropped trigger");
        self.offer();
    }

    /// Pass a dirty signal through the cooldown gate
    fn offer(&mut self) {
        let now = Instant::now();
        let decision = {
            let mut state = self.shared.lock();
            let anchor = state.cooldown_anchor();
            state.cooldown.offer(anchor, now)
        };

        match decision {
            GateDecision::Forward => {
                info!(event = decision.as_event(), outcome = "forward", "Cooldown elapsed");
                self.dispatch();
            }
            GateDecision::Deferred(until) => {
                info!(
                    event = decision.as_event(),
                    outcome = "deferred",
                    wait_secs = until.saturating_duration_since(now).as_secs_f64(),
                    "Cooldown active, snapshot deferred"
                );
            }
            GateDecision::Coalesced(until) => {
                debug!(
                    event = decision.as_event(),
                    outcome = "coalesced",
                    wait_secs = until.saturating_duration_since(now).as_secs_f64(),
                    "Snapshot already deferred"
                );
            }
        }
    }

    /// Start a creation, or remember the trigger if the executor is busy
    fn dispatch(&mut self) {
        match self.executor.try_begin() {
            Ok(guard) => {
                let executor = Arc::clone(&self.executor);
                let description = self.pending_description.take();
                tokio::spawn(async move {
                    // Outcome is logged by the executor
                    let _ = executor.create_with(guard, description).await;
                });
            }
            Err(e) => {
                {
                    let mut state = self.shared.lock();
                    state.retry_when_idle = true;
                    state.dropped_triggers += 1;
                }
                info!(
                    event = "snapshot_skipped",
                    outcome = e.kind(),
                    "Executor busy, trigger retried when idle"
                );
            }
        }
    }

    /// Bounded re-arm sequence after a watch failure
    ///
    /// The dead receiver is dropped before unsubscribing so a producer stuck
    /// on a full channel is released. `Ok(None)` means shutdown was requested
    /// while retrying.
    async fn rearm(
        &mut self,
        rx: mpsc::Receiver<WatchMessage>,
        failure: SnapshotError,
    ) -> Result<Option<mpsc::Receiver<WatchMessage>>, EngineError> {
        error!(
            event = "watch_failed",
            outcome = failure.kind(),
            error = %failure,
            "Change watch failed"
        );
        drop(rx);
        self.source.disarm();

        let mut last = failure;
        let mut backoff = self.options.watch_retry_backoff;
        for attempt in 1..=self.options.watch_retry_attempts {
            if !self.backoff(backoff).await {
                return Ok(None);
            }

            match self.source.arm() {
                Ok(rx) => {
                    info!(event = "watch_rearmed", outcome = "ok", attempt, "Change watch re-armed");
                    // Whatever changed while unwatched is unknown
                    self.on_change(ChangeEvent::new(self.root.clone(), ChangeKind::Modified));
                    return Ok(Some(rx));
                }
                Err(e) => {
                    warn!(
                        event = "watch_failed",
                        outcome = "rearm_failed",
                        attempt,
                        error = %e,
                        "Re-arming change watch failed"
                    );
                    last = e;
                }
            }
            backoff = backoff.saturating_mul(2);
        }

        Err(EngineError::WatchExhausted {
            path: self.root.clone(),
            attempts: self.options.watch_retry_attempts,
            last,
        })
    }

    /// Wait out one re-arm backoff while still servicing the timers
    ///
    /// Returns false when shutdown was requested.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let wake = Instant::now() + delay;
        loop {
            let (debounce_at, cooldown_at, retry) = self.deadlines();
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => return false,

                _ = sleep_until_opt(debounce_at) => self.on_debounce_due(),

                _ = sleep_until_opt(cooldown_at) => self.on_cooldown_due(),

                _ = self.shared.wait_idle(), if retry => self.on_idle(),

                _ = tokio::time::sleep_until(wake) => return true,
            }
        }
    }

    async fn stop(&mut self) {
        self.source.disarm();
        {
            let mut state = self.shared.lock();
            if let Some(batch) = state.debounce.cancel() {
                info!(events = batch.event_count(), "Discarding unsettled change batch");
            }
            state.cooldown.cancel();
            state.retry_when_idle = false;
        }

        if self.shared.is_busy() {
            info!("Waiting for in-flight snapshot operation");
            let waited = tokio::time::timeout(self.options.shutdown_grace, self.shared.wait_idle()).await;
            if waited.is_err() {
                warn!(
                    grace_secs = self.options.shutdown_grace.as_secs(),
                    "In-flight snapshot operation did not finish before shutdown"
                );
            }
        }
        info!("Snapshot engine stopped");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{disk_full, engine_fixture, test_options, tool_failure, FakeTool};
    use tokio::time::{sleep, sleep_until};

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn assert_near(actual: Duration, expected_secs: u64) {
        let expected = secs(expected_secs);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(500),
            "expected ~{}s, got {:?}",
            expected_secs,
            actual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_then_cooldown_scenario() {
        let tool = FakeTool::new();
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.change("a.txt").await;
        sleep_until(t0 + secs(2)).await;
        fx.control.change("b.txt").await;
        sleep_until(t0 + secs(4)).await;
        fx.control.change("c.txt").await;

        sleep_until(t0 + secs(60)).await;
        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 1);
        assert_near(calls[0], 9);

        sleep_until(t0 + secs(65)).await;
        fx.control.change("d.txt").await;
        sleep_until(t0 + secs(100)).await;

        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 2);
        assert_near(calls[1], 70);
        assert!(calls[1] - calls[0] >= secs(60));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_produces_one_snapshot() {
        let tool = FakeTool::new();
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        for i in 0..200 {
            fx.control.change(&format!("file{}.bin", i)).await;
            sleep(Duration::from_millis(5)).await;
        }
        sleep_until(t0 + secs(30)).await;

        assert_eq!(tool.snapshot_calls(), 1);
        let listing = handle.catalog().list().await.unwrap();
        assert_eq!(listing.len(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_defers_and_coalesces() {
        let tool = FakeTool::new();
        let options = EngineOptions {
            debounce: secs(1),
            max_batch_age: secs(10),
            ..test_options()
        };
        let fx = engine_fixture(tool.clone(), options);
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.change("a").await;
        sleep_until(t0 + secs(10)).await;
        fx.control.change("b").await;
        sleep_until(t0 + secs(20)).await;
        fx.control.change("c").await;

        sleep_until(t0 + secs(30)).await;
        let status = handle.status();
        assert!(status.cooldown_deferred_until.is_some());
        assert_eq!(tool.snapshot_calls(), 1);

        sleep_until(t0 + secs(200)).await;
        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 2);
        assert_near(calls[0], 1);
        assert_near(calls[1], 61);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disk_full_does_not_stop_monitoring() {
        let tool = FakeTool::new();
        tool.fail_next(disk_full());
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.change("a").await;
        sleep_until(t0 + secs(10)).await;
        {
            let status = handle.status();
            assert!(!status.in_progress);
            assert!(status.last_snapshot_at.is_none());
            assert_eq!(status.snapshots_failed, 1);
        }

        // Disk errors leave the cooldown clock alone
        fx.control.change("b").await;
        sleep_until(t0 + secs(30)).await;
        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 2);
        assert_near(calls[1], 15);
        assert_eq!(handle.status().snapshots_created, 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_failure_counts_toward_cooldown() {
        let tool = FakeTool::new();
        tool.fail_next(tool_failure());
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.change("a").await;
        sleep_until(t0 + secs(10)).await;
        fx.control.change("b").await;
        sleep_until(t0 + secs(100)).await;

        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 2);
        assert_near(calls[0], 5);
        assert_near(calls[1], 65);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_executor_retries_trigger_when_idle() {
        let tool = FakeTool::new();
        tool.set_delay(secs(20));
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        let executor = handle.executor();
        let manual = tokio::spawn(async move { executor.create(Some("manual".into())).await });

        sleep_until(t0 + secs(1)).await;
        fx.control.change("a").await;

        // Batch fires at 6 while the manual snapshot runs until 20
        sleep_until(t0 + secs(10)).await;
        assert_eq!(handle.status().dropped_triggers, 1);

        manual.await.unwrap().unwrap();
        sleep_until(t0 + secs(200)).await;

        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 2);
        assert_near(calls[0], 0);
        // Retried on idle at 20, then held by the cooldown until 80
        assert_near(calls[1], 80);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_snapshot_bypasses_and_resets_cooldown() {
        let tool = FakeTool::new();
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.change("a").await;
        sleep_until(t0 + secs(10)).await;

        let manual = handle.snapshot_now(Some("before upgrade".into())).await.unwrap();
        assert_eq!(manual.description.as_deref(), Some("before upgrade"));

        sleep_until(t0 + secs(20)).await;
        fx.control.change("b").await;
        sleep_until(t0 + secs(200)).await;

        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 3);
        assert_near(calls[0], 5);
        assert_near(calls[1], 10);
        assert_near(calls[2], 70);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enforce_retention_through_handle() {
        let tool = FakeTool::new();
        let mut options = test_options();
        options.retention.max_count = 1;
        let fx = engine_fixture(tool.clone(), options);
        let handle = fx.engine.start().unwrap();

        for name in ["vol_20240101_000000", "vol_20240102_000000", "vol_20240103_000000"] {
            std::fs::create_dir_all(fx.snapshot_dir.join(name)).unwrap();
        }

        let report = handle.enforce_retention().await.unwrap();
        assert_eq!(report.deleted, vec!["vol_20240101_000000", "vol_20240102_000000"]);
        let again = handle.enforce_retention().await.unwrap();
        assert!(again.deleted.is_empty());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_failure_is_rearmed() {
        let tool = FakeTool::new();
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();
        assert_eq!(fx.control.arm_count(), 1);

        fx.control.fail().await;
        sleep_until(t0 + secs(30)).await;

        assert_eq!(fx.control.arm_count(), 2);
        // Re-arm marks the tree dirty: backoff 1s + debounce 5s
        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 1);
        assert_near(calls[0], 6);

        // Watching continues on the new subscription
        fx.control.change("after.txt").await;
        sleep_until(t0 + secs(200)).await;
        assert_eq!(tool.snapshot_calls(), 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_releases_receiver_before_disarm() {
        let tool = FakeTool::new();
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.fail().await;
        sleep_until(t0 + secs(10)).await;

        assert_eq!(fx.control.arm_count(), 2);
        assert_eq!(fx.control.disarms_with_live_receiver(), 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_forward_fires_during_rearm_backoff() {
        let tool = FakeTool::new();
        let options = EngineOptions {
            watch_retry_backoff: secs(30),
            ..test_options()
        };
        let fx = engine_fixture(tool.clone(), options);
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.change("a").await;
        sleep_until(t0 + secs(10)).await;
        // Settles at 15s and is deferred to the end of the cooldown at ~65s
        fx.control.change("b").await;
        sleep_until(t0 + secs(20)).await;

        // Watch dies; re-arm attempts at ~50s and ~110s both fail
        fx.control.fail_all_arms();
        fx.control.fail().await;
        sleep_until(t0 + secs(100)).await;

        let calls = tool.snapshot_offsets(t0);
        assert_eq!(calls.len(), 2);
        assert_near(calls[0], 5);
        assert_near(calls[1], 65);
        assert_eq!(fx.control.arm_count(), 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rearm_is_fatal() {
        let tool = FakeTool::new();
        let fx = engine_fixture(tool.clone(), test_options());
        let mut handle = fx.engine.start().unwrap();

        fx.control.fail_all_arms();
        fx.control.fail().await;

        let err = tokio::time::timeout(secs(600), handle.wait())
            .await
            .expect("engine should stop")
            .unwrap_err();
        match err {
            EngineError::WatchExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fx.control.arm_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_creation() {
        let tool = FakeTool::new();
        tool.set_delay(secs(20));
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.change("a").await;
        sleep_until(t0 + secs(6)).await;
        assert!(handle.status().in_progress);

        handle.shutdown().await.unwrap();
        assert!(Instant::now() >= t0 + secs(25));

        let snapshots = std::fs::read_dir(&fx.snapshot_dir).unwrap().count();
        assert_eq!(snapshots, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_unsettled_batch() {
        let tool = FakeTool::new();
        let fx = engine_fixture(tool.clone(), test_options());
        let t0 = Instant::now();
        let handle = fx.engine.start().unwrap();

        fx.control.change("a").await;
        sleep_until(t0 + secs(1)).await;
        assert_eq!(handle.status().pending_events, 1);

        handle.shutdown().await.unwrap();
        sleep_until(t0 + secs(100)).await;
        assert_eq!(tool.snapshot_calls(), 0);
        assert!(!fx.control.is_armed());
    }
}
