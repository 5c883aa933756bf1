//! # nexus-deadlockd
//!
//! Daemon plumbing for the NexusDB deadlock detector: configuration file
//! handling and the ingest/tick loop behind the `nexus-deadlockd` binary.
//!
//! Lock events arrive as JSON lines (see
//! [`RawLockEvent`](nexus_deadlock::RawLockEvent)) on stdin or from a file.
//! Detection ticks run on a fixed interval; when the input ends, buffered
//! events are flushed and one last tick runs. Ticks measure time by the
//! wall clock for live feeds and by the newest event timestamp when
//! replaying a file (see [`TickClock`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nexus_deadlock::{
    DeadlockEngine, DetectResult, DeadlockStore, DetectorConfig, FileStore, MemoryStore, TickReport,
    TreeEnsemble,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Time source for detection ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TickClock {
    /// Current wall-clock time.
    Wall,
    /// Newest event timestamp seen on the input.
    Event,
}

/// Daemon configuration file.
///
/// ```toml
/// records = "/var/lib/nexusdb/deadlocks.jsonl"
/// model = "/etc/nexusdb/deadlock-model.json"
/// clock = "event"
///
/// [detector]
/// wait_threshold_secs = 10.0
/// dedup_window_secs = 300
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Lock event input; stdin when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<PathBuf>,

    /// Deadlock record log; records are kept in memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<PathBuf>,

    /// Tree-ensemble model; the classifier signal is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,

    /// Tick clock; event time for file input and wall time for stdin when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<TickClock>,

    /// Detection settings.
    #[serde(default)]
    pub detector: DetectorConfig,
}

impl DaemonConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        config.detector.validate()?;
        Ok(config)
    }

    /// Returns the clock ticks should use.
    pub fn tick_clock(&self) -> TickClock {
        match (self.clock, &self.events) {
            (Some(clock), _) => clock,
            (None, Some(_)) => TickClock::Event,
            (None, None) => TickClock::Wall,
        }
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Input lines read.
    pub lines: u64,
    /// Ticks that completed.
    pub ticks: u64,
    /// New deadlock records emitted.
    pub records: u64,
    /// Ticks that failed to emit a record.
    pub failed_ticks: u64,
}

/// Opens the configured record store.
pub async fn open_store(config: &DaemonConfig) -> Result<Arc<dyn DeadlockStore>> {
    match &config.records {
        Some(path) => {
            let store = FileStore::open(path)
                .await
                .with_context(|| format!("Failed to open record log {}", path.display()))?;
            info!("Record log: {} ({} records)", path.display(), store.len());
            Ok(Arc::new(store))
        }
        None => {
            warn!("No record log configured, keeping deadlock records in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Builds the engine, loading the classifier model if one is configured.
pub fn build_engine(config: &DaemonConfig, store: Arc<dyn DeadlockStore>) -> Result<DeadlockEngine> {
    let engine = DeadlockEngine::new(config.detector.clone(), store)?;

    match &config.model {
        Some(path) => {
            let model = TreeEnsemble::from_file(path)
                .with_context(|| format!("Failed to load model {}", path.display()))?;
            info!("Classifier: {} trees from {}", model.tree_count(), path.display());
            Ok(engine.with_classifier(Arc::new(model)))
        }
        None => Ok(engine),
    }
}

/// Feeds `input` into the engine and ticks every `tick_interval` until the
/// input ends or `shutdown` completes.
///
/// A tick that fails to emit a record is logged and the loop continues; the
/// record is retried on the next tick.
pub async fn run<R, S>(
    engine: Arc<DeadlockEngine>,
    input: R,
    tick_interval: Duration,
    clock: TickClock,
    shutdown: S,
) -> Result<RunSummary>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut summary = RunSummary::default();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read lock events")? {
                    Some(line) => {
                        summary.lines += 1;
                        if !line.trim().is_empty() {
                            if let Err(e) = engine.ingest_json(&line) {
                                debug!(line = summary.lines, error = %e, "skipping lock event line");
                            }
                        }
                    }
                    None => {
                        debug!("lock event input closed");
                        engine.flush();
                        run_tick(&engine, clock, &mut summary).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                run_tick(&engine, clock, &mut summary).await;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
    Ok(summary)
}

async fn tick(engine: &DeadlockEngine, clock: TickClock) -> DetectResult<TickReport> {
    match clock {
        TickClock::Wall => engine.tick().await,
        TickClock::Event => engine.tick_at(engine.latest_event_time()).await,
    }
}

async fn run_tick(engine: &DeadlockEngine, clock: TickClock, summary: &mut RunSummary) {
    match tick(engine, clock).await {
        Ok(report) => {
            summary.ticks += 1;
            if report.record.is_some() {
                summary.records += 1;
            }
            log_report(&report);
        }
        Err(e) if e.is_recoverable() => {
            summary.failed_ticks += 1;
            warn!("Detection tick failed: {}", e);
        }
        Err(e) => {
            summary.failed_ticks += 1;
            error!("Detection tick failed: {}", e);
        }
    }
}

fn log_report(report: &TickReport) {
    debug!(
        nodes = report.stats.node_count,
        edges = report.stats.edge_count,
        version = report.stats.graph_version,
        pending_events = report.stats.pending_events,
        pending_records = report.stats.pending_records,
        scan_us = report.stats.scan_duration.as_micros() as u64,
        suppressed = report.suppressed,
        "tick complete"
    );
}
