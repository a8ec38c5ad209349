//! Remove one snapshot by name

use crate::locks::DaemonLock;
use crate::util;
use anyhow::{Context, Result};
use catalog::RetentionEngine;
use owo_colors::OwoColorize;
use snapwatch_core::Config;

pub async fn run(config: &Config, name: &str) -> Result<()> {
    util::ensure_privileges(config)?;
    let _lock = DaemonLock::acquire(&config.snapshot_dir)
        .context("Cannot delete while another snapwatch process owns the snapshot directory")?;

    let catalog = util::catalog_for(config);
    let Some(snapshot) = catalog
        .find(name)
        .await
        .context("Failed to read snapshot directory")?
    else {
        anyhow::bail!(
            "No snapshot named '{}' for {} in {}",
            name,
            catalog.source_path().display(),
            catalog.snapshot_dir().display()
        );
    };

    let tool = scheduler::volume_tool(config, catalog.snapshot_dir());
    let retention = RetentionEngine::new(catalog, tool, config.tool_timeout());
    retention
        .delete(&snapshot)
        .await
        .with_context(|| format!("Failed to delete {}", snapshot.name))?;

    println!("{} {}", "Deleted".green().bold(), snapshot.name.yellow());
    Ok(())
}
