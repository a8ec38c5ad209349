//! Run the snapshot daemon in the foreground

use crate::locks::DaemonLock;
use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use scheduler::Engine;
use snapwatch_core::Config;
use tracing::{error, info, warn};

pub async fn run(config: &Config) -> Result<()> {
    // 1. Environment checks
    util::ensure_privileges(config)?;

    // 2. Exclusive access to the snapshot directory
    let lock = DaemonLock::acquire(&config.snapshot_dir)?;

    // 3. Validate the target and start watching
    let engine = Engine::from_config(config)
        .await
        .context("Failed to prepare snapshot engine")?;
    let mut handle = engine.start().context("Failed to start snapshot engine")?;

    println!(
        "{} {} -> {}",
        "Watching".green().bold(),
        config.watch_dir.display().to_string().cyan(),
        config.snapshot_dir.display()
    );
    if config.test_mode {
        println!("{}", "Test mode: snapshots are plain directory copies".dimmed());
    }

    // 4. Run until a signal or a fatal engine error
    let fatal = tokio::select! {
        result = handle.wait() => Some(result),
        _ = shutdown_signal() => None,
    };
    let result = match fatal {
        Some(result) => result,
        None => {
            info!("Shutdown signal received");
            handle.shutdown().await
        }
    };

    if let Err(e) = lock.release() {
        warn!(error = %e, "Failed to remove daemon lock");
    }
    result.context("Snapshot engine stopped")?;
    info!("Snapwatch stopped");
    Ok(())
}

/// SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Unable to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
