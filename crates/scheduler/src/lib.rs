//! Snapshot scheduling engine
//!
//! This crate provides:
//! - `EngineState`: the single guarded coordination object per watch target
//! - `CooldownGate`: minimum spacing between automatic snapshots
//! - `SnapshotExecutor`: mutually exclusive snapshot creation and retention
//! - `Engine`: the coordinating task tying watcher, debounce, cooldown and
//!   executor together, plus the `EngineHandle` used to drive it
//!
//! Flow: change events -> debounce -> cooldown gate -> executor -> retention.

pub mod cooldown;
pub mod engine;
pub mod executor;
pub mod state;

#[cfg(test)]
mod testing;

// Re-exports
pub use cooldown::{CooldownGate, GateDecision};
pub use engine::{
    prepare_target, volume_tool, Engine, EngineError, EngineHandle, EngineOptions, EngineStatus,
};
pub use executor::SnapshotExecutor;
pub use state::{EngineState, OperationGuard, SharedState};
