//! Show snapshot statistics and daemon state

use crate::locks::{self, LockHolder};
use crate::util;
use anyhow::{Context, Result};
use catalog::CatalogStats;
use owo_colors::OwoColorize;
use serde::Serialize;
use snapwatch_core::{CleanupMode, Config};
use std::path::PathBuf;

#[derive(Serialize)]
struct StatusReport {
    watch_dir: PathBuf,
    snapshot_dir: PathBuf,
    test_mode: bool,
    cleanup_mode: CleanupMode,
    max_snapshots: usize,
    retention_days: u64,
    daemon: Option<LockHolder>,
    stats: CatalogStats,
}

pub async fn run(config: &Config, json: bool) -> Result<()> {
    // 1. Catalog stats
    let catalog = util::catalog_for(config);
    let tool = scheduler::volume_tool(config, catalog.snapshot_dir());
    let stats = catalog
        .stats(tool.as_ref())
        .await
        .context("Failed to read snapshot catalog")?;

    // 2. Lock holder
    let daemon = locks::holder(&config.snapshot_dir)?;

    let report = StatusReport {
        watch_dir: config.watch_dir.clone(),
        snapshot_dir: config.snapshot_dir.clone(),
        test_mode: config.test_mode,
        cleanup_mode: config.cleanup_mode,
        max_snapshots: config.max_snapshots,
        retention_days: config.retention_days,
        daemon,
        stats,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "Snapwatch Status".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("Watching:      {}", report.watch_dir.display().to_string().cyan());
    println!("Snapshots in:  {}", report.snapshot_dir.display());
    if report.test_mode {
        println!("Mode:          {}", "test (directory copies)".yellow());
    }
    match report.cleanup_mode {
        CleanupMode::Count => println!("Retention:     newest {}", report.max_snapshots),
        CleanupMode::Time => println!("Retention:     {} days", report.retention_days),
    }
    println!();

    print!("Daemon:        ");
    match &report.daemon {
        Some(holder) => {
            println!("{}", "Running ✓".green());
            println!("  PID:         {}", holder.pid);
            println!(
                "  Since:       {} ({})",
                util::format_absolute_time(holder.started_at),
                util::format_relative_time(holder.started_at).dimmed()
            );
        }
        None => {
            println!("{}", "Not running".yellow());
            println!("  {}", "Tip: Start with 'snapwatch run'".dimmed());
        }
    }
    println!();

    let stats = &report.stats;
    println!("Snapshots:");
    println!("  Count:       {}", stats.count);
    println!("  Total size:  {}", util::format_size(stats.total_size));
    if let Some(oldest) = &stats.oldest {
        println!(
            "  Oldest:      {} ({})",
            oldest.name.yellow(),
            util::format_relative_time(oldest.created_at).dimmed()
        );
    }
    if let Some(newest) = &stats.newest {
        println!(
            "  Newest:      {} ({})",
            newest.name.yellow(),
            util::format_relative_time(newest.created_at).dimmed()
        );
    }
    if stats.count == 0 {
        println!("  {}", "No snapshots yet".dimmed());
    }

    Ok(())
}
