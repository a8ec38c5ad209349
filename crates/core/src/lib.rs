//! Core types for Snapwatch
//!
//! This crate provides:
//! - Snapshot records and the sortable naming scheme
//! - The error taxonomy shared by every component
//! - Configuration loading (TOML + environment overrides)
//! - The external volume tool contract (btrfs and test-mode copy)
//! - Watch target validation

pub mod config;
pub mod error;
pub mod snapshot;
pub mod target;
pub mod tool;

// Re-exports
pub use config::{CleanupMode, Config, ConfigError};
pub use error::{SnapshotError, ToolOperation};
pub use snapshot::{Snapshot, SnapshotName};
pub use target::WatchTarget;
pub use tool::{BtrfsTool, CopyTool, VolumeTool};

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;
