//! Trade Guardian - keeps the trading bot worker alive
//!
//! 1. Loads configuration (file + `GUARDIAN__*` environment)
//! 2. Spawns the worker and probes its health endpoint every interval
//! 3. Restarts it with exponential backoff when it dies or stops deciding
//! 4. Halts, leaving the worker as-is, when the restart budget is spent
//!
//! Exit status: 0 after a stop signal, 1 on configuration or startup
//! failure, 3 when halted for manual intervention.

use std::fs::OpenOptions;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use trade_guardian::{GuardianConfig, LoggingConfig, Outcome, Supervisor};

/// Process exit status when the guardian halts
const EXIT_HALTED: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reported once, by anyhow, on the way out
    let config = GuardianConfig::load()?;

    init_logging(&config.logging)?;

    info!("Starting Trade Guardian...");
    info!(
        "Worker: {} {}, health: {}",
        config.worker.program,
        config.worker.args.join(" "),
        config.worker.health_url
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if wait_for_stop_signal().await {
            let _ = shutdown_tx.send(true);
        }
    });

    let supervisor = Supervisor::from_config(&config, shutdown_rx)?;
    match supervisor.run().await? {
        Outcome::Stopped => Ok(()),
        Outcome::Halted { reason, last_worker } => {
            error!(
                "Exiting after halt ({}); last worker: {}",
                reason,
                last_worker
                    .map(|w| w.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            std::process::exit(EXIT_HALTED);
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(logging.max_level()))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

/// SIGTERM, SIGINT or Ctrl-C. Returns false when no handler could be
/// installed, in which case the guardian only stops on halt.
#[cfg(unix)]
async fn wait_for_stop_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            warn!("Could not install unix signal handlers, falling back to Ctrl-C");
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
    true
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> bool {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl-C");
            true
        }
        Err(e) => {
            error!("Could not listen for Ctrl-C: {}", e);
            false
        }
    }
}
