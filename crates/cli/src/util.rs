//! Shared utilities for CLI commands

use anyhow::Result;
use catalog::SnapshotCatalog;
use chrono::{DateTime, Local, Utc};
use snapwatch_core::Config;

/// The privileged tool needs root; test mode does not
pub fn ensure_privileges(config: &Config) -> Result<()> {
    if config.test_mode || nix::unistd::Uid::effective().is_root() {
        return Ok(());
    }
    anyhow::bail!("snapwatch must run as root to manage btrfs snapshots (or pass --test-mode)")
}

/// Catalog for the configured target, without validating it
///
/// The watch directory is canonicalized when it exists so the name prefix
/// matches what the daemon uses.
pub fn catalog_for(config: &Config) -> SnapshotCatalog {
    let source = std::fs::canonicalize(&config.watch_dir).unwrap_or_else(|_| config.watch_dir.clone());
    SnapshotCatalog::new(&config.snapshot_dir, source)
}

/// Format an age as relative time ("2 hours ago")
pub fn format_age(age: chrono::Duration) -> String {
    let seconds = age.num_seconds();
    if seconds < 0 {
        return "in the future".to_string();
    }

    let (n, unit) = if seconds < 60 {
        (seconds, "second")
    } else if seconds < 3600 {
        (seconds / 60, "minute")
    } else if seconds < 86400 {
        (seconds / 3600, "hour")
    } else if seconds < 604800 {
        (seconds / 86400, "day")
    } else {
        (seconds / 604800, "week")
    };
    let plural = if n == 1 { "" } else { "s" };
    format!("{} {}{} ago", n, unit, plural)
}

/// Format a timestamp as relative time from now
pub fn format_relative_time(ts: DateTime<Utc>) -> String {
    format_age(Utc::now() - ts)
}

/// Format a timestamp in local time ("2024-01-03 14:30:00")
pub fn format_absolute_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
