//! Cooldown gate between debounce and the executor

use std::time::Duration;
use tokio::time::Instant;

/// Longest interval the gate honours; anything above is clamped
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What the gate did with a dirty signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Cooldown has elapsed; create now
    Forward,
    /// Too early; one forward is now scheduled at the given instant
    Deferred(Instant),
    /// A forward was already scheduled; this signal merges into it
    Coalesced(Instant),
}

impl GateDecision {
    pub fn as_event(&self) -> &'static str {
        match self {
            GateDecision::Forward => "cooldown_forwarded",
            GateDecision::Deferred(_) => "cooldown_deferred",
            GateDecision::Coalesced(_) => "cooldown_coalesced",
        }
    }
}

/// Enforces the minimum interval between automatic snapshots
///
/// At most one deferred forward exists at any time. When it comes due the
/// caller takes it with [`CooldownGate::take_due`] and offers again, so a
/// manual snapshot taken in the meantime pushes the forward further out.
#[derive(Debug)]
pub struct CooldownGate {
    interval: Duration,
    deferred_until: Option<Instant>,
}

impl CooldownGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.min(MAX_INTERVAL),
            deferred_until: None,
        }
    }

    /// Decide on a dirty signal given the last snapshot time
    pub fn offer(&mut self, anchor: Option<Instant>, now: Instant) -> GateDecision {
        if let Some(until) = self.deferred_until {
            return GateDecision::Coalesced(until);
        }

        match anchor {
            Some(last) if now < last + self.interval => {
                let until = last + self.interval;
                self.deferred_until = Some(until);
                GateDecision::Deferred(until)
            }
            _ => GateDecision::Forward,
        }
    }

    /// When the scheduled forward is due, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deferred_until
    }

    /// Clear the scheduled forward if it is due; true when it was
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deferred_until {
            Some(until) if now >= until => {
                self.deferred_until = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the scheduled forward (shutdown)
    pub fn cancel(&mut self) {
        self.deferred_until = None;
    }
}
