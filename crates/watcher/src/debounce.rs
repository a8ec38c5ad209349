//! Debouncing of change bursts
//!
//! Every event pushes the firing deadline out by one debounce window. A batch
//! that keeps receiving events is still fired once it reaches the maximum
//! batch age, so a writer that never pauses cannot starve snapshots.
//!
//! The aggregator is plain state: the caller owns the clock and the timer and
//! asks [`DebounceAggregator::poll`] whether the batch is due. Because a push
//! and a poll cannot interleave on `&mut self`, an event arriving right at the
//! deadline either extends the batch or lands in the next one; it is never
//! lost and never causes a second fire.

use crate::{ChangeEvent, ChangeKind};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Longest window or batch age honoured; anything above is clamped
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Events accumulated since the last quiescent point
#[derive(Debug, Clone)]
pub struct PendingBatch {
    /// Latest change kind per path
    paths: BTreeMap<PathBuf, ChangeKind>,
    /// Total events received, including repeats on the same path
    event_count: usize,
    first_at: Instant,
    last_at: Instant,
    /// Whether the batch was cut by the maximum age instead of quiescence
    forced: bool,
}

impl PendingBatch {
    fn new(now: Instant) -> Self {
        Self {
            paths: BTreeMap::new(),
            event_count: 0,
            first_at: now,
            last_at: now,
            forced: false,
        }
    }

    fn add(&mut self, event: ChangeEvent, now: Instant) {
        self.paths.insert(event.path, event.kind);
        self.event_count += 1;
        self.last_at = now;
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn unique_paths(&self) -> usize {
        self.paths.len()
    }

    pub fn first_at(&self) -> Instant {
        self.first_at
    }

    pub fn last_at(&self) -> Instant {
        self.last_at
    }

    pub fn forced(&self) -> bool {
        self.forced
    }

    /// Dominant change kind: modified wins, then created, then deleted
    pub fn primary_kind(&self) -> Option<ChangeKind> {
        let has = |k: ChangeKind| self.paths.values().any(|v| *v == k);
        [ChangeKind::Modified, ChangeKind::Created, ChangeKind::Deleted]
            .into_iter()
            .find(|k| has(*k))
    }

    /// Short human-readable summary used as the snapshot description
    ///
    /// Lists up to three file names, otherwise just the count.
    pub fn describe(&self) -> String {
        let kind = self.primary_kind().map(|k| k.as_str()).unwrap_or("changed");
        let files = if self.paths.len() <= 3 {
            self.paths
                .keys()
                .map(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| p.display().to_string())
                })
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            format!("{} files", self.paths.len())
        };
        format!("{}: {}", kind, files)
    }
}

/// Coalesces change events into batches
#[derive(Debug)]
pub struct DebounceAggregator {
    window: Duration,
    max_age: Duration,
    batch: Option<PendingBatch>,
}

impl DebounceAggregator {
    /// `max_age` is clamped to at least `window`, both to at most [`MAX_WAIT`]
    pub fn new(window: Duration, max_age: Duration) -> Self {
        let window = window.min(MAX_WAIT);
        Self {
            window,
            max_age: max_age.clamp(window, MAX_WAIT),
            batch: None,
        }
    }

    /// Add an event, re-arming the deadline; returns the new deadline
    pub fn push(&mut self, event: ChangeEvent, now: Instant) -> Instant {
        self.batch
            .get_or_insert_with(|| PendingBatch::new(now))
            .add(event, now);
        // A batch always exists here
        self.deadline().unwrap_or(now + self.window)
    }

    /// When the pending batch fires, if one is armed
    pub fn deadline(&self) -> Option<Instant> {
        self.batch.as_ref().map(|b| {
            let quiet = b.last_at + self.window;
            let cap = b.first_at + self.max_age;
            quiet.min(cap)
        })
    }

    /// Take the batch if its deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<PendingBatch> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let mut batch = self.batch.take()?;
        batch.forced = now.saturating_duration_since(batch.last_at) < self.window;
        Some(batch)
    }

    /// Drop the pending batch without firing (shutdown)
    pub fn cancel(&mut self) -> Option<PendingBatch> {
        self.batch.take()
    }

    pub fn is_armed(&self) -> bool {
        self.batch.is_some()
    }

    pub fn pending_events(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.event_count)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}
