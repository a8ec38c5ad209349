//! Test doubles for the volume tool and the change source

use crate::engine::{Engine, EngineOptions};
use crate::executor::SnapshotExecutor;
use crate::state::{EngineState, SharedState};
use crate::CooldownGate;
use catalog::RetentionPolicy;
use async_trait::async_trait;
use parking_lot::Mutex;
use snapwatch_core::tool::classify_failure;
use snapwatch_core::{CleanupMode, SnapshotError, ToolOperation, VolumeTool, WatchTarget};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;
use watcher::{ChangeEvent, ChangeKind, ChangeSource, DebounceAggregator, WatchMessage};

pub fn test_options() -> EngineOptions {
    EngineOptions {
        debounce: Duration::from_secs(5),
        max_batch_age: Duration::from_secs(50),
        cooldown: Duration::from_secs(60),
        tool_timeout: Duration::from_secs(30),
        min_free_bytes: 0,
        watch_retry_attempts: 3,
        watch_retry_backoff: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(60),
        retention: RetentionPolicy {
            mode: CleanupMode::Count,
            max_count: 50,
            max_age: chrono::Duration::days(7),
        },
    }
}

pub fn disk_full() -> SnapshotError {
    classify_failure(
        ToolOperation::Snapshot,
        Some(1),
        "ERROR: cannot snapshot '/data/vol': No space left on device",
    )
}

pub fn tool_failure() -> SnapshotError {
    classify_failure(ToolOperation::Snapshot, Some(1), "ERROR: cannot snapshot: Invalid argument")
}

/// Volume tool that records call times and creates plain directories
pub struct FakeTool {
    snapshots: Mutex<Vec<Instant>>,
    deletes: AtomicUsize,
    failures: Mutex<VecDeque<SnapshotError>>,
    delay: Mutex<Duration>,
    subvolume: AtomicBool,
    hang_checks: AtomicBool,
}

impl FakeTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshots: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            subvolume: AtomicBool::new(true),
            hang_checks: AtomicBool::new(false),
        })
    }

    /// Queue an error for the next snapshot call
    pub fn fail_next(&self, error: SnapshotError) {
        self.failures.lock().push_back(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_subvolume(&self, valid: bool) {
        self.subvolume.store(valid, Ordering::SeqCst);
    }

    /// Subvolume checks never answer
    pub fn hang_checks(&self) {
        self.hang_checks.store(true, Ordering::SeqCst);
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Snapshot call times relative to `t0`
    pub fn snapshot_offsets(&self, t0: Instant) -> Vec<Duration> {
        self.snapshots.lock().iter().map(|t| *t - t0).collect()
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VolumeTool for FakeTool {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_subvolume(&self, _path: &Path) -> Result<bool, SnapshotError> {
        if self.hang_checks.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.subvolume.load(Ordering::SeqCst))
    }

    async fn snapshot(&self, _source: &Path, dest: &Path) -> Result<(), SnapshotError> {
        self.snapshots.lock().push(Instant::now());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        std::fs::create_dir_all(dest).map_err(|e| SnapshotError::io(dest, e))
    }

    async fn delete(&self, path: &Path) -> Result<(), SnapshotError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        std::fs::remove_dir_all(path).map_err(|e| SnapshotError::io(path, e))
    }

    async fn measure(&self, _path: &Path) -> Result<u64, SnapshotError> {
        Ok(0)
    }
}

/// Change source fed by the test through [`SourceControl`]
pub struct ChannelSource {
    control: SourceControl,
}

#[derive(Clone)]
pub struct SourceControl {
    root: PathBuf,
    sender: Arc<Mutex<Option<mpsc::Sender<WatchMessage>>>>,
    arms: Arc<AtomicUsize>,
    fail_arms: Arc<AtomicBool>,
    live_disarms: Arc<AtomicUsize>,
}

impl SourceControl {
    fn sender(&self) -> mpsc::Sender<WatchMessage> {
        self.sender.lock().clone().expect("source is not armed")
    }

    pub async fn change(&self, name: &str) {
        let event = ChangeEvent::new(self.root.join(name), ChangeKind::Modified);
        self.sender().send(WatchMessage::Change(event)).await.unwrap();
    }

    pub async fn fail(&self) {
        let error = SnapshotError::Watch {
            path: self.root.clone(),
            detail: "inotify watch limit reached".to_string(),
        };
        self.sender().send(WatchMessage::Failed(error)).await.unwrap();
    }

    /// Every later `arm` call fails
    pub fn fail_all_arms(&self) {
        self.fail_arms.store(true, Ordering::SeqCst);
    }

    /// Number of `arm` calls, failed ones included
    pub fn arm_count(&self) -> usize {
        self.arms.load(Ordering::SeqCst)
    }

    /// `disarm` calls made while the consumer still held the receiver
    pub fn disarms_with_live_receiver(&self) -> usize {
        self.live_disarms.load(Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.sender.lock().is_some()
    }
}

impl ChangeSource for ChannelSource {
    fn arm(&mut self) -> Result<mpsc::Receiver<WatchMessage>, SnapshotError> {
        self.disarm();
        self.control.arms.fetch_add(1, Ordering::SeqCst);
        if self.control.fail_arms.load(Ordering::SeqCst) {
            return Err(SnapshotError::Watch {
                path: self.control.root.clone(),
                detail: "watched directory does not exist".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(1024);
        *self.control.sender.lock() = Some(tx);
        Ok(rx)
    }

    fn disarm(&mut self) {
        if let Some(sender) = self.control.sender.lock().take() {
            if !sender.is_closed() {
                self.control.live_disarms.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// Watch dir `vol` and snapshot dir `snaps` in a temp directory
pub struct Fixture {
    pub _temp: TempDir,
    pub snapshot_dir: PathBuf,
    pub shared: Arc<SharedState>,
    pub executor: SnapshotExecutor,
}

fn target_dirs() -> (TempDir, PathBuf, PathBuf) {
    let temp = TempDir::new().unwrap();
    let watch = temp.path().join("vol");
    let snaps = temp.path().join("snaps");
    std::fs::create_dir_all(&watch).unwrap();
    (temp, watch, snaps)
}

pub fn fixture(tool: Arc<FakeTool>, options: EngineOptions) -> Fixture {
    let (temp, watch, snaps) = target_dirs();
    let shared = SharedState::new(EngineState::new(
        DebounceAggregator::new(options.debounce, options.max_batch_age),
        CooldownGate::new(options.cooldown),
    ));
    let target = Arc::new(WatchTarget::trusted(watch, snaps.clone()));
    let executor = SnapshotExecutor::new(target, tool, Arc::clone(&shared), &options);
    Fixture {
        _temp: temp,
        snapshot_dir: snaps,
        shared,
        executor,
    }
}

pub struct EngineFixture {
    pub _temp: TempDir,
    pub snapshot_dir: PathBuf,
    pub engine: Engine,
    pub control: SourceControl,
}

pub fn engine_fixture(tool: Arc<FakeTool>, options: EngineOptions) -> EngineFixture {
    let (temp, watch, snaps) = target_dirs();
    let control = SourceControl {
        root: watch.clone(),
        sender: Arc::new(Mutex::new(None)),
        arms: Arc::new(AtomicUsize::new(0)),
        fail_arms: Arc::new(AtomicBool::new(false)),
        live_disarms: Arc::new(AtomicUsize::new(0)),
    };
    let source = ChannelSource {
        control: control.clone(),
    };
    let engine = Engine::new(
        WatchTarget::trusted(watch, snaps.clone()),
        tool,
        Box::new(source),
        options,
    );
    EngineFixture {
        _temp: temp,
        snapshot_dir: snaps,
        engine,
        control,
    }
}
