//! Configuration resolution: file, then environment, then flags

use crate::logging::LogFormat;
use anyhow::{Context, Result};
use clap::Args;
use snapwatch_core::Config;
use std::path::PathBuf;
use tracing::info;

/// Flags shared by every subcommand
#[derive(Debug, Default, Args)]
pub struct GlobalArgs {
    /// Config file (default: ./snapwatch.toml, /etc/snapwatch/config.toml,
    /// then the user config dir)
    #[arg(short, long, global = true, env = "SNAPWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Plain directory copies instead of btrfs snapshots; no root required
    #[arg(long, global = true)]
    pub test_mode: bool,

    /// Directory to watch (overrides watch_dir)
    #[arg(long, global = true)]
    pub watch_dir: Option<PathBuf>,

    /// Directory snapshots are created in (overrides snapshot_dir)
    #[arg(long, global = true)]
    pub snapshot_dir: Option<PathBuf>,

    /// Count-mode retention threshold (overrides max_snapshots)
    #[arg(long, global = true)]
    pub max_snapshots: Option<usize>,

    /// Log level when RUST_LOG is not set (overrides log_level)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Console log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl GlobalArgs {
    /// Apply command-line overrides on top of file and environment values
    pub fn apply(&self, config: &mut Config) {
        if self.test_mode {
            config.test_mode = true;
        }
        if let Some(dir) = &self.watch_dir {
            config.watch_dir = dir.clone();
        }
        if let Some(dir) = &self.snapshot_dir {
            config.snapshot_dir = dir.clone();
        }
        if let Some(max) = self.max_snapshots {
            config.max_snapshots = max;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

/// Effective configuration and where it came from
pub struct Loaded {
    pub config: Config,
    pub source: Option<PathBuf>,
}

impl Loaded {
    /// Record the config source once logging is up
    pub fn log_source(&self) {
        match &self.source {
            Some(path) => info!(path = %path.display(), "Using configuration file"),
            None => info!("Using default configuration"),
        }
    }
}

pub fn load(args: &GlobalArgs) -> Result<Loaded> {
    let (mut config, source) =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(Loaded { config, source })
}
