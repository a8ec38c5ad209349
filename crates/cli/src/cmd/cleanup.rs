//! Apply the retention policy once

use crate::locks::DaemonLock;
use crate::util;
use anyhow::{Context, Result};
use catalog::{RetentionEngine, RetentionPolicy};
use chrono::Utc;
use owo_colors::OwoColorize;
use snapwatch_core::{CleanupMode, Config};

pub async fn run(config: &Config) -> Result<()> {
    util::ensure_privileges(config)?;
    let _lock = DaemonLock::acquire(&config.snapshot_dir)
        .context("Cannot clean up while another snapwatch process owns the snapshot directory")?;

    let catalog = util::catalog_for(config);
    let tool = scheduler::volume_tool(config, catalog.snapshot_dir());
    let policy = RetentionPolicy::from(config);
    let retention = RetentionEngine::new(catalog, tool, config.tool_timeout());

    match policy.mode {
        CleanupMode::Count => println!(
            "{} keeping the newest {}",
            "Retention:".bold(),
            policy.max_count
        ),
        CleanupMode::Time => println!(
            "{} keeping snapshots younger than {} days",
            "Retention:".bold(),
            config.retention_days
        ),
    }

    let report = retention
        .enforce(&policy, Utc::now())
        .await
        .context("Retention failed")?;

    if report.deleted.is_empty() && report.errors.is_empty() {
        println!("{}", "Nothing to delete".dimmed());
    }
    for name in &report.deleted {
        println!("  {} {}", "deleted".green(), name);
    }
    for failure in &report.errors {
        println!("  {} {}: {}", "failed".red(), failure.name, failure.error);
    }

    if !report.is_clean() {
        anyhow::bail!("{} snapshot(s) could not be deleted", report.errors.len());
    }
    Ok(())
}
