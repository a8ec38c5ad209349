//! File system watching for Snapwatch
//!
//! This crate provides:
//! - A recursive change watcher over the watched subvolume (notify)
//! - Ignore rules for editor noise, caches and the snapshot directory
//! - Debouncing of bursty change streams into single batches
//!
//! The watcher runs on notify's own thread and feeds a bounded tokio channel.
//! Scheduling decisions happen on the receiving side.

pub mod debounce;
pub mod ignore;

pub use debounce::{DebounceAggregator, PendingBatch};
pub use self::ignore::{IgnoreConfig, IgnoreRules};

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use snapwatch_core::SnapshotError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default capacity of the change channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// File system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path that changed
    pub path: PathBuf,
    /// Type of change
    pub kind: ChangeKind,
    /// Wall-clock time the notification was received
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Utc::now(),
        }
    }
}

/// Type of file system event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    /// File created
    Created,
    /// File modified
    Modified,
    /// File deleted
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Item delivered on the change channel
#[derive(Debug)]
pub enum WatchMessage {
    Change(ChangeEvent),
    /// The subscription is dead and must be re-armed
    Failed(SnapshotError),
}

/// Producer of change notifications that can be re-armed after a failure
pub trait ChangeSource: Send {
    /// Start a fresh subscription, replacing any previous one
    fn arm(&mut self) -> Result<mpsc::Receiver<WatchMessage>, SnapshotError>;

    /// Stop the current subscription, if any
    fn disarm(&mut self);
}

/// Recursive watcher over one directory tree
pub struct ChangeWatcher {
    root: PathBuf,
    inner: RecommendedWatcher,
    dropped: Arc<AtomicU64>,
}

impl ChangeWatcher {
    /// Subscribe to changes under `root`
    ///
    /// Events matching `rules` never reach the channel. When the channel is
    /// full further change events are dropped and counted: a full channel
    /// already guarantees the consumer will see the tree as dirty.
    pub fn start(
        root: &Path,
        rules: Arc<IgnoreRules>,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<WatchMessage>), SnapshotError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let ignore_sources = rules.active_sources();

        let handler_root = root.to_path_buf();
        let handler_dropped = Arc::clone(&dropped);
        let handler = move |result: notify::Result<Event>| {
            for message in translate(&handler_root, &rules, result) {
                match message {
                    WatchMessage::Change(event) => {
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            tx.try_send(WatchMessage::Change(event))
                        {
                            handler_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    failure => {
                        // Failures must not be lost to a full channel
                        let _ = tx.blocking_send(failure);
                    }
                }
            }
        };

        let mut inner = RecommendedWatcher::new(handler, notify::Config::default())
            .map_err(|e| watch_error(root, e))?;
        inner
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| watch_error(root, e))?;

        info!(
            path = %root.display(),
            ignore_sources,
            "File watcher started"
        );

        Ok((
            Self {
                root: root.to_path_buf(),
                inner,
                dropped,
            },
            rx,
        ))
    }

    /// Unsubscribe and release the notification handle
    pub fn stop(mut self) {
        if let Err(e) = self.inner.unwatch(&self.root) {
            debug!(path = %self.root.display(), error = %e, "Unwatch failed (already gone?)");
        }
        info!(path = %self.root.display(), "File watcher stopped");
    }

    /// Change events dropped because the channel was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn watch_error(root: &Path, e: notify::Error) -> SnapshotError {
    SnapshotError::Watch {
        path: root.to_path_buf(),
        detail: e.to_string(),
    }
}

/// Turn one raw notification into zero or more channel messages
fn translate(root: &Path, rules: &IgnoreRules, result: notify::Result<Event>) -> Vec<WatchMessage> {
    let event = match result {
        Ok(event) => event,
        Err(e) => return vec![WatchMessage::Failed(watch_error(root, e))],
    };

    if event.need_rescan() {
        // Queue overflow: individual paths are lost, the tree is dirty
        warn!(path = %root.display(), "Change notifications overflowed, treating tree as modified");
        return vec![WatchMessage::Change(ChangeEvent::new(root, ChangeKind::Modified))];
    }

    let mut out = Vec::new();
    for (i, path) in event.paths.iter().enumerate() {
        if matches!(event.kind, EventKind::Remove(_)) && path == root {
            out.push(WatchMessage::Failed(SnapshotError::Watch {
                path: root.to_path_buf(),
                detail: "watched directory was removed".to_string(),
            }));
            continue;
        }

        let kind = match classify(&event.kind, i) {
            Some(kind) => kind,
            None => continue,
        };

        if kind != ChangeKind::Deleted && path.is_dir() {
            continue;
        }
        if rules.should_ignore(path) {
            debug!(path = %path.display(), "Ignoring event");
            continue;
        }

        out.push(WatchMessage::Change(ChangeEvent::new(path.clone(), kind)));
    }

    if out.is_empty() && matches!(event.kind, EventKind::Remove(_)) && !root.exists() {
        out.push(WatchMessage::Failed(SnapshotError::Watch {
            path: root.to_path_buf(),
            detail: "watched directory no longer exists".to_string(),
        }));
    }
    out
}

/// Map a notify event kind to a change kind; `index` is the path position
fn classify(kind: &EventKind, index: usize) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if index == 0 {
                Some(ChangeKind::Deleted)
            } else {
                Some(ChangeKind::Created)
            }
        }
        EventKind::Modify(_) | EventKind::Any => Some(ChangeKind::Modified),
        EventKind::Access(_) | EventKind::Other => None,
    }
}

/// [`ChangeSource`] backed by a real [`ChangeWatcher`]
pub struct NotifySource {
    root: PathBuf,
    rules: Arc<IgnoreRules>,
    capacity: usize,
    active: Option<ChangeWatcher>,
}

impl NotifySource {
    pub fn new(root: PathBuf, rules: IgnoreRules) -> Self {
        Self {
            root,
            rules: Arc::new(rules),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            active: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl ChangeSource for NotifySource {
    fn arm(&mut self) -> Result<mpsc::Receiver<WatchMessage>, SnapshotError> {
        self.disarm();
        if !self.root.is_dir() {
            return Err(SnapshotError::Watch {
                path: self.root.clone(),
                detail: "watched directory does not exist".to_string(),
            });
        }
        let (watcher, rx) = ChangeWatcher::start(&self.root, Arc::clone(&self.rules), self.capacity)?;
        self.active = Some(watcher);
        Ok(rx)
    }

    fn disarm(&mut self) {
        if let Some(watcher) = self.active.take() {
            let dropped = watcher.dropped_events();
            if dropped > 0 {
                debug!(dropped, "Change events dropped on full channel during subscription");
            }
            watcher.stop();
        }
    }
}
