//! Snapshot catalog and retention for Snapwatch
//!
//! This crate provides:
//! - The snapshot catalog: the snapshot directory listing is the database
//! - Retention policies (count and age based) and their enforcement
//!
//! Nothing here caches directory state. Every query re-lists, so the catalog
//! can never drift from what is actually on disk.

pub mod catalog;
pub mod retention;

// Re-exports
pub use catalog::{CatalogStats, SnapshotCatalog};
pub use retention::{RetentionEngine, RetentionFailure, RetentionPolicy, RetentionReport};

/// Result type for catalog operations
pub type Result<T> = snapwatch_core::Result<T>;
