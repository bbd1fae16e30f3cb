//! drover - worker process pool
//!
//! Keeps a pool of long-lived worker subprocesses alive, replaces the ones
//! that crash, and tears everything down cleanly on Ctrl-C.
//!
//! ## Usage
//!
//! ```bash
//! # Run the pool described in drover.yaml
//! drover --config drover.yaml
//!
//! # With verbose logging
//! drover --config drover.yaml -v
//!
//! # Validate the configuration and print it as JSON
//! drover --config drover.yaml --check
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use drover_core::{DroverConfig, DroverError, LogGuard, init_logging};
use drover_pool::{CommandAllocator, Event, EventBus, Pool};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Subscriber id used by the CLI's event logger.
const EVENT_LOGGER_ID: &str = "drover-cli";

/// drover worker pool
///
/// Spawns the configured worker command `num_workers` times and keeps
/// that many workers alive until interrupted.
#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "drover.yaml")]
    config: PathBuf,

    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to $DROVER_LOG_DIR, then ~/.drover/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run(&cli).await {
        Ok(()) => {
            info!("drover exited normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("drover error: {}", e);
            eprintln!("Error: {}", e);
            if let Some(hint) = e.guidance() {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::from(1)
        }
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> drover_core::Result<LogGuard> {
    let debug = cli.verbose > 0;
    init_logging(cli.log_dir.clone(), debug)
}

async fn run(cli: &Cli) -> drover_core::Result<()> {
    let config = DroverConfig::load(&cli.config)?;

    if cli.check {
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| DroverError::internal(format!("serializing config: {e}")))?;
        println!("{json}");
        return Ok(());
    }

    let events = Arc::new(EventBus::new());
    let logger = spawn_event_logger(&events)?;

    let allocator = Arc::new(CommandAllocator::new(config.worker.clone()));
    info!(command = %config.worker.display(), "starting worker pool");
    let pool = Pool::new(config.pool.clone(), allocator, Arc::clone(&events)).await?;

    for worker in pool.infos() {
        info!(pid = worker.pid, state = %worker.state, "worker ready");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown requested, destroying worker pool");

    let deadline = CancellationToken::new();
    let timer = deadline.clone();
    let destroy_timeout = config.pool.destroy_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(destroy_timeout).await;
        timer.cancel();
    });
    pool.destroy(&deadline).await;

    events.unsubscribe(EVENT_LOGGER_ID);
    let _ = logger.await;
    Ok(())
}

/// Log every pool event until the subscription is dropped.
fn spawn_event_logger(events: &EventBus) -> drover_core::Result<tokio::task::JoinHandle<()>> {
    let (tx, mut rx) = mpsc::channel::<Event>(256);
    events.subscribe_all(EVENT_LOGGER_ID, tx)?;

    Ok(tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            info!(
                target: "drover::events",
                event_type = %event.event_type,
                source = %event.source,
                "{}",
                event.message
            );
        }
    }))
}
