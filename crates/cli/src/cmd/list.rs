//! List snapshots

use crate::util;
use anyhow::{Context, Result};
use chrono::Utc;
use owo_colors::OwoColorize;
use snapwatch_core::Config;

pub async fn run(config: &Config, sizes: bool, json: bool) -> Result<()> {
    let catalog = util::catalog_for(config);
    let listing = if sizes {
        let tool = scheduler::volume_tool(config, catalog.snapshot_dir());
        catalog.list_detailed(tool.as_ref()).await
    } else {
        catalog.list().await
    };
    let snapshots = listing.context("Failed to list snapshots")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("{}", "No snapshots yet".dimmed());
        return Ok(());
    }

    let width = snapshots.iter().map(|s| s.name.len()).max().unwrap_or(0);
    let now = Utc::now();
    for snapshot in &snapshots {
        let name = format!("{:width$}", snapshot.name, width = width);
        let age = util::format_age(snapshot.age(now));
        match snapshot.size_bytes {
            Some(size) => println!("{}  {:>16}  {}", name.yellow(), age.dimmed(), util::format_size(size)),
            None if sizes => println!("{}  {:>16}  {}", name.yellow(), age.dimmed(), "?".dimmed()),
            None => println!("{}  {:>16}", name.yellow(), age.dimmed()),
        }
    }
    println!();
    println!("{} snapshot(s) in {}", snapshots.len(), catalog.snapshot_dir().display());
    Ok(())
}
