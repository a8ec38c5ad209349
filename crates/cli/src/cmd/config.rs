//! Configuration inspection command

use crate::settings::Loaded;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use snapwatch_core::Config;

/// Print the effective configuration as TOML
pub fn run_show(loaded: &Loaded) -> Result<()> {
    let body = toml::to_string_pretty(&loaded.config).context("Failed to render configuration")?;
    match &loaded.source {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# Defaults (no config file found)"),
    }
    println!("# Environment and command-line overrides applied");
    print!("{}", body);
    Ok(())
}

/// Print a commented example configuration
pub fn run_example() -> Result<()> {
    print!("{}", Config::example_toml());
    Ok(())
}

/// Print the config file in use and every search location
pub fn run_path(loaded: &Loaded) -> Result<()> {
    match &loaded.source {
        Some(path) => println!("{}", path.display()),
        None => println!("{}", "No config file found".dimmed()),
    }
    println!();
    println!("{}", "Search order:".bold());
    for path in Config::search_paths() {
        let marker = if path.exists() { "✓".green().to_string() } else { " ".to_string() };
        println!("  {} {}", marker, path.display());
    }
    Ok(())
}
