//! Snapwatch CLI - snapwatch command

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod locks;
mod logging;
mod settings;
mod util;

use settings::GlobalArgs;

/// Snapwatch - automatic btrfs snapshots on file changes
#[derive(Parser)]
#[command(name = "snapwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the directory and snapshot it on changes (runs until SIGINT/SIGTERM)
    Run,
    /// List snapshots, oldest first
    List {
        /// Measure and show snapshot sizes
        #[arg(long)]
        sizes: bool,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show snapshot statistics and daemon state
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Create one snapshot now, then apply retention
    Snapshot {
        /// Free-form note logged with the snapshot
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Apply the retention policy once
    Cleanup,
    /// Delete one snapshot of the watched directory by name
    Delete {
        /// Snapshot directory name, as shown by `list`
        name: String,
    },
    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print a commented example configuration
    Example,
    /// Print the config file in use and the search locations
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Printing the example must work even when the local config is broken
    if let Commands::Config(ConfigCommands::Example) = cli.command {
        return cmd::config::run_example();
    }

    let loaded = tracing::subscriber::with_default(logging::bootstrap(cli.global.log_format), || {
        settings::load(&cli.global)
    })?;
    let _log_guard = logging::init(&loaded.config, cli.global.log_format);
    loaded.log_source();

    match cli.command {
        Commands::Run => cmd::run::run(&loaded.config).await,
        Commands::List { sizes, json } => cmd::list::run(&loaded.config, sizes, json).await,
        Commands::Status { json } => cmd::status::run(&loaded.config, json).await,
        Commands::Snapshot { description } => cmd::snapshot::run(&loaded.config, description).await,
        Commands::Cleanup => cmd::cleanup::run(&loaded.config).await,
        Commands::Delete { name } => cmd::delete::run(&loaded.config, &name).await,
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::Show => cmd::config::run_show(&loaded),
            ConfigCommands::Example => cmd::config::run_example(),
            ConfigCommands::Path => cmd::config::run_path(&loaded),
        },
    }
}
