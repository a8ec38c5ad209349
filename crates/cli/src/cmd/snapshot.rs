//! Create one snapshot now

use crate::locks::DaemonLock;
use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use scheduler::SnapshotExecutor;
use snapwatch_core::Config;

pub async fn run(config: &Config, description: Option<String>) -> Result<()> {
    util::ensure_privileges(config)?;
    let _lock = DaemonLock::acquire(&config.snapshot_dir)
        .context("Cannot snapshot while another snapwatch process owns the snapshot directory")?;

    let executor = SnapshotExecutor::from_config(config)
        .await
        .context("Failed to prepare snapshot")?;
    let snapshot = executor
        .create(description)
        .await
        .context("Snapshot failed")?;

    println!("{} {}", "Created".green().bold(), snapshot.name.yellow());
    println!("  Path:   {}", snapshot.path.display());
    println!("  Source: {}", snapshot.source_path.display());
    if let Some(description) = &snapshot.description {
        println!("  Note:   {}", description);
    }
    Ok(())
}
