//! NexusDB Deadlock Detector Daemon
//!
//! The `nexus-deadlockd` binary:
//! - Reads JSON-lines lock events from stdin or a file
//! - Runs detection ticks on a timer
//! - Appends detected deadlocks to a record log
//! - Handles graceful shutdown on SIGTERM/SIGINT
//!
//! # Usage
//!
//! ```bash
//! # Read events from stdin, keep records in memory
//! lockmgr-events | nexus-deadlockd
//!
//! # Replay an event file into a record log (ticks follow event time)
//! nexus-deadlockd --events events.jsonl --records deadlocks.jsonl
//!
//! # Follow a live file against the wall clock
//! nexus-deadlockd --events /var/log/nexusdb/locks.jsonl --clock wall
//!
//! # Use a trained classifier and a configuration file
//! nexus-deadlockd --config /etc/nexusdb/deadlockd.toml --model model.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nexus_deadlockd::{build_engine, open_store, run, DaemonConfig, TickClock};

/// NexusDB Deadlock Detector Daemon
#[derive(Parser, Debug)]
#[command(
    name = "nexus-deadlockd",
    author = "NexusDB Team",
    version,
    about = "NexusDB online deadlock detector",
    long_about = "Builds a wait-for graph from lock events and records detected deadlocks.\n\n\
                  Events are JSON lines with transaction_id, resource_id, kind and timestamp_micros."
)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", env = "NEXUS_DEADLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Lock event file (defaults to stdin)
    #[arg(short = 'e', long, value_name = "FILE", env = "NEXUS_DEADLOCK_EVENTS")]
    events: Option<PathBuf>,

    /// Deadlock record log (defaults to in-memory)
    #[arg(short = 'r', long, value_name = "FILE", env = "NEXUS_DEADLOCK_RECORDS")]
    records: Option<PathBuf>,

    /// Tree-ensemble classifier model (JSON)
    #[arg(short = 'm', long, value_name = "FILE", env = "NEXUS_DEADLOCK_MODEL")]
    model: Option<PathBuf>,

    /// Tick clock: event for file replay, wall for live input
    #[arg(long, value_enum, env = "NEXUS_DEADLOCK_CLOCK")]
    clock: Option<TickClock>,

    /// Detection tick interval in milliseconds
    #[arg(long, env = "NEXUS_DEADLOCK_TICK_INTERVAL_MS")]
    tick_interval_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "NEXUS_LOG_LEVEL")]
    log_level: String,

    /// Print configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    // Load configuration
    let config = load_config(&args)?;

    // Print config and exit if requested
    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("nexus-deadlockd v{}", env!("CARGO_PKG_VERSION"));

    run_daemon(config).await
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_new(format!(
        "nexus_deadlockd={level},nexus_deadlock={level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so stdout stays free for --print-config.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    // Start with defaults
    let mut config = if let Some(path) = &args.config {
        DaemonConfig::from_file(path).context("Failed to load config file")?
    } else {
        DaemonConfig::default()
    };

    // Override with command-line arguments
    if let Some(path) = &args.events {
        config.events = Some(path.clone());
    }
    if let Some(path) = &args.records {
        config.records = Some(path.clone());
    }
    if let Some(path) = &args.model {
        config.model = Some(path.clone());
    }
    if let Some(clock) = args.clock {
        config.clock = Some(clock);
    }
    if let Some(ms) = args.tick_interval_ms {
        config.detector = config.detector.with_tick_interval(Duration::from_millis(ms));
    }

    config.detector.validate()?;
    Ok(config)
}

async fn open_input(config: &DaemonConfig) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    match &config.events {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            info!("Reading lock events from {}", path.display());
            Ok(Box::new(BufReader::new(file)))
        }
        None => {
            info!("Reading lock events from stdin");
            Ok(Box::new(BufReader::new(tokio::io::stdin())))
        }
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let engine = Arc::new(build_engine(&config, store)?);
    let input = open_input(&config).await?;

    info!("Detector configuration:");
    info!("  Wait threshold: {}s", config.detector.wait_threshold_secs);
    info!("  Dedup window: {}s", config.detector.dedup_window_secs);
    info!("  Reorder window: {}ms", config.detector.reorder_window_ms);
    info!("  Tick interval: {}ms", config.detector.tick_interval_ms);
    info!("  Tick clock: {:?}", config.tick_clock());

    let summary = run(
        engine.clone(),
        input,
        config.detector.tick_interval(),
        config.tick_clock(),
        shutdown_signal(),
    )
    .await?;

    let pending = engine.pending_records();
    if pending > 0 {
        warn!("{} deadlock records were never acknowledged by the store", pending);
    }

    info!(
        "Processed {} lines in {} ticks, {} deadlocks recorded",
        summary.lines, summary.ticks, summary.records
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
