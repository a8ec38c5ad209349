//! Engine coordination state
//!
//! One [`EngineState`] exists per watch target. It lives behind a single
//! `parking_lot::Mutex` that is held only while a decision is made, never
//! across an `.await`. The `in_progress` flag, not the lock, is what
//! serializes snapshot operations: it is set under the lock before the tool
//! runs and cleared under the lock by [`OperationGuard`] when it finishes.

use crate::cooldown::CooldownGate;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use watcher::DebounceAggregator;

/// Mutable scheduling state for one target
#[derive(Debug)]
pub struct EngineState {
    pub debounce: DebounceAggregator,
    pub cooldown: CooldownGate,
    /// Completion time of the last successful creation
    pub last_snapshot_at: Option<Instant>,
    /// Wall-clock twin of `last_snapshot_at`, for reporting
    pub last_snapshot_wall: Option<DateTime<Utc>>,
    /// Last creation that reached the tool and failed
    pub last_failed_attempt_at: Option<Instant>,
    /// A snapshot or retention operation is running
    pub in_progress: bool,
    /// An automatic trigger was dropped on a busy executor
    pub retry_when_idle: bool,
    pub snapshots_created: u64,
    pub snapshots_failed: u64,
    pub dropped_triggers: u64,
}

impl EngineState {
    pub fn new(debounce: DebounceAggregator, cooldown: CooldownGate) -> Self {
        Self {
            debounce,
            cooldown,
            last_snapshot_at: None,
            last_snapshot_wall: None,
            last_failed_attempt_at: None,
            in_progress: false,
            retry_when_idle: false,
            snapshots_created: 0,
            snapshots_failed: 0,
            dropped_triggers: 0,
        }
    }

    /// Reference point for the cooldown interval
    ///
    /// The later of the last success and the last failed tool attempt, so a
    /// tool that keeps failing is not hammered on every batch.
    pub fn cooldown_anchor(&self) -> Option<Instant> {
        match (self.last_snapshot_at, self.last_failed_attempt_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// State plus the idle notification, shared between engine components
#[derive(Debug)]
pub struct SharedState {
    state: Mutex<EngineState>,
    idle: Notify,
}

impl SharedState {
    pub fn new(state: EngineState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            idle: Notify::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock()
    }

    /// Claim the mutual-exclusion flag, or `None` if it is already held
    pub fn try_begin(self: &Arc<Self>) -> Option<OperationGuard> {
        let mut state = self.state.lock();
        if state.in_progress {
            return None;
        }
        state.in_progress = true;
        Some(OperationGuard {
            shared: Arc::clone(self),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().in_progress
    }

    /// Resolve once no operation is in progress
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }
}

/// Holds the `in_progress` flag; releases it on drop, whatever the outcome
#[derive(Debug)]
pub struct OperationGuard {
    shared: Arc<SharedState>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.shared.state.lock().in_progress = false;
        self.shared.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shared() -> Arc<SharedState> {
        SharedState::new(EngineState::new(
            DebounceAggregator::new(Duration::from_secs(5), Duration::from_secs(50)),
            CooldownGate::new(Duration::from_secs(60)),
        ))
    }

    #[test]
    fn test_guard_is_exclusive_and_released_on_drop() {
        let shared = shared();

        let guard = shared.try_begin().expect("first claim succeeds");
        assert!(shared.is_busy());
        assert!(shared.try_begin().is_none());

        drop(guard);
        assert!(!shared.is_busy());
        assert!(shared.try_begin().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_wakes_on_release() {
        let shared = shared();
        let guard = shared.try_begin().unwrap();

        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_anchor_takes_latest() {
        let shared = shared();
        let now = Instant::now();
        let mut state = shared.lock();
        assert_eq!(state.cooldown_anchor(), None);

        state.last_snapshot_at = Some(now);
        assert_eq!(state.cooldown_anchor(), Some(now));

        state.last_failed_attempt_at = Some(now + Duration::from_secs(30));
        assert_eq!(state.cooldown_anchor(), Some(now + Duration::from_secs(30)));
    }
}
