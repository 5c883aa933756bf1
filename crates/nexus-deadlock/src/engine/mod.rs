//! The detection service.
//!
//! [`DeadlockEngine`] owns the wait-for graph for one detection session.
//! Lock-manager workers call [`ingest`](DeadlockEngine::ingest)
//! concurrently; a scheduler calls [`tick`](DeadlockEngine::tick).
//!
//! # Tick
//!
//! ```text
//!  ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//!  │ prune dedup, │──▶│ drain reorder │──▶│   snapshot   │
//!  │ re-emit      │   │ buffer        │   │   graph      │
//!  │ pending      │   └───────────────┘   └──────┬───────┘
//!  └──────────────┘                              │
//!        ┌───────────────────────────────────────┘
//!        ▼
//!  ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//!  │ cycle +      │──▶│ dedup reserve │──▶│ store insert │
//!  │ classifier + │   │               │   │ (timeout)    │
//!  │ wait signal  │   └───────────────┘   └──────────────┘
//!  └──────────────┘
//! ```
//!
//! Graph mutation never suspends. The only `.await` is the store call, and
//! no lock is held across it: the vertex set is reserved in the dedup window
//! first, so concurrent ticks cannot emit the same deadlock twice.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nexus_common::types::Timestamp;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::classifier::{AnomalyClassifier, ClassifierVerdict, FeatureTracker};
use crate::config::DetectorConfig;
use crate::cycle::DetectorStats;
use crate::decision::{wait_samples, DeadlockVerdict, DedupWindow, HybridDecisionEngine};
use crate::error::{DetectError, DetectResult, StoreError, StoreResult};
use crate::event::{Admission, LockEvent, RawLockEvent, ReorderBuffer};
use crate::graph::WaitForGraph;
use crate::store::{DeadlockRecord, DeadlockStore, StoreAck};

/// Engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Detection ticks run.
    pub ticks: AtomicU64,
    /// Events accepted for processing.
    pub events_ingested: AtomicU64,
    /// Events dropped because they could not be parsed.
    pub malformed_events: AtomicU64,
    /// Events that arrived behind already applied events.
    pub late_events: AtomicU64,
    /// Classifier calls that failed.
    pub classifier_failures: AtomicU64,
    /// Records acknowledged by the store.
    pub records_emitted: AtomicU64,
    /// Positive verdicts suppressed by the dedup window.
    pub records_suppressed: AtomicU64,
    /// Store calls that failed or timed out.
    pub emission_failures: AtomicU64,
}

impl EngineStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Diagnostics for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickStats {
    /// Transactions in the graph snapshot.
    pub node_count: usize,
    /// Wait edges in the graph snapshot.
    pub edge_count: usize,
    /// Graph version the tick ran against.
    pub graph_version: u64,
    /// Events still held back by the reorder buffer.
    pub pending_events: usize,
    /// Records still waiting for a store acknowledgement.
    pub pending_records: usize,
    /// Time spent on snapshot, classifier and cycle scan.
    pub scan_duration: Duration,
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    /// The positive verdict, if any.
    pub verdict: Option<DeadlockVerdict>,
    /// The record emitted for the verdict, if it was new.
    pub record: Option<DeadlockRecord>,
    /// True if the verdict matched an already recorded deadlock.
    pub suppressed: bool,
    /// Diagnostics.
    pub stats: TickStats,
}

impl TickReport {
    /// Returns true if the tick found a deadlock (new or already recorded).
    pub fn is_deadlock(&self) -> bool {
        self.verdict.is_some()
    }
}

/// Online deadlock detection over a lock event feed.
pub struct DeadlockEngine {
    config: DetectorConfig,
    graph: WaitForGraph,
    reorder: Mutex<ReorderBuffer>,
    features: Mutex<FeatureTracker>,
    decision: HybridDecisionEngine,
    classifier: Option<Arc<dyn AnomalyClassifier>>,
    store: Arc<dyn DeadlockStore>,
    dedup: Mutex<DedupWindow>,
    stats: EngineStats,
}

impl DeadlockEngine {
    /// Creates an engine that emits records to `store`.
    pub fn new(config: DetectorConfig, store: Arc<dyn DeadlockStore>) -> DetectResult<Self> {
        config.validate()?;

        Ok(Self {
            graph: WaitForGraph::new(),
            reorder: Mutex::new(ReorderBuffer::new(
                config.reorder_window(),
                config.reorder_capacity,
            )),
            features: Mutex::new(FeatureTracker::new()),
            decision: HybridDecisionEngine::new(config.wait_threshold()),
            classifier: None,
            store,
            dedup: Mutex::new(DedupWindow::new(config.dedup_window())),
            stats: EngineStats::new(),
            config,
        })
    }

    /// Installs the anomaly classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn AnomalyClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Feeds one lock event.
    ///
    /// The event is applied once the reorder window has passed it; events
    /// that arrive behind already applied ones are applied immediately.
    pub fn ingest(&self, event: LockEvent) {
        self.stats
            .events_ingested
            .fetch_add(1, AtomicOrdering::Relaxed);

        let mut reorder = self.reorder.lock();
        if let Admission::Late(event) = reorder.push(event) {
            self.stats.late_events.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(%event, "applying late lock event");
            self.apply(&event);
        }
        for event in reorder.drain_ready(None) {
            self.apply(&event);
        }
    }

    /// Validates and feeds a raw event. Malformed events are dropped and
    /// counted.
    pub fn ingest_raw(&self, raw: RawLockEvent) -> DetectResult<()> {
        match LockEvent::try_from(raw) {
            Ok(event) => {
                self.ingest(event);
                Ok(())
            }
            Err(e) => {
                self.stats
                    .malformed_events
                    .fetch_add(1, AtomicOrdering::Relaxed);
                warn!(error = %e, "dropping malformed lock event");
                Err(e.into())
            }
        }
    }

    /// Decodes and feeds one JSON-encoded raw event.
    pub fn ingest_json(&self, line: &str) -> DetectResult<()> {
        match serde_json::from_str::<RawLockEvent>(line) {
            Ok(raw) => self.ingest_raw(raw),
            Err(e) => {
                self.stats
                    .malformed_events
                    .fetch_add(1, AtomicOrdering::Relaxed);
                warn!(error = %e, "dropping undecodable lock event");
                Err(DetectError::Event(e.into()))
            }
        }
    }

    /// Applies every buffered event regardless of the reorder window.
    pub fn flush(&self) {
        let mut reorder = self.reorder.lock();
        for event in reorder.flush() {
            self.apply(&event);
        }
    }

    fn apply(&self, event: &LockEvent) {
        if self.graph.apply(event) {
            self.features.lock().observe(event);
        }
    }

    /// Runs one detection tick against the current wall clock.
    pub async fn tick(&self) -> DetectResult<TickReport> {
        self.tick_at(Timestamp::now()).await
    }

    /// Runs one detection tick with `now` as the detection clock.
    ///
    /// Fails if re-emitting a pending record or emitting a new one fails;
    /// the record stays pending and is retried on the next tick. A failed
    /// re-emission does not skip detection: the tick still scans the graph
    /// and emits what it finds before reporting the failure.
    pub async fn tick_at(&self, now: Timestamp) -> DetectResult<TickReport> {
        self.stats.ticks.fetch_add(1, AtomicOrdering::Relaxed);

        let pending = {
            let mut dedup = self.dedup.lock();
            dedup.prune(now);
            dedup.pending()
        };
        let mut deferred = None;
        for record in pending {
            debug!(deadlock_id = %record.deadlock_id, "re-emitting pending deadlock record");
            if let Err(e) = self.emit_or_fail(record).await {
                deferred = Some(e);
                break;
            }
        }

        let report = self.detect(now).await?;
        match deferred {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn detect(&self, now: Timestamp) -> DetectResult<TickReport> {
        {
            let mut reorder = self.reorder.lock();
            for event in reorder.drain_ready(Some(now)) {
                self.apply(&event);
            }
        }

        let start = Instant::now();
        let snapshot = self.graph.snapshot();
        let classifier_verdict = self.classify();
        let waits = wait_samples(&snapshot, now);
        let remembered = self.dedup.lock().remembered();
        let verdict = self.decision.evaluate_excluding(
            &snapshot,
            &remembered,
            classifier_verdict.as_ref(),
            &waits,
        );
        let scan_duration = start.elapsed();

        let mut report = TickReport {
            verdict: None,
            record: None,
            suppressed: false,
            stats: TickStats {
                node_count: snapshot.node_count(),
                edge_count: snapshot.edge_count(),
                graph_version: snapshot.version(),
                pending_events: self.reorder.lock().len(),
                pending_records: 0,
                scan_duration,
            },
        };

        if !verdict.is_positive() {
            report.stats.pending_records = self.pending_records();
            return Ok(report);
        }

        let record = DeadlockRecord::new(verdict.involved_transactions(), now);
        let reserved = self.dedup.lock().reserve(record.clone());
        report.verdict = Some(verdict);

        if !reserved {
            self.stats
                .records_suppressed
                .fetch_add(1, AtomicOrdering::Relaxed);
            debug!(txns = ?record.involved_transactions, "deadlock already recorded");
            report.suppressed = true;
            report.stats.pending_records = self.pending_records();
            return Ok(report);
        }

        if let Some(verdict) = &report.verdict {
            let signals = verdict.signals();
            info!(
                deadlock_id = %record.deadlock_id,
                txns = ?record.involved_transactions,
                cycle = signals.cycle,
                classifier = signals.classifier,
                wait = signals.wait,
                "deadlock detected"
            );
        }

        self.emit_or_fail(record.clone()).await?;
        report.record = Some(record);
        report.stats.pending_records = self.pending_records();
        Ok(report)
    }

    fn classify(&self) -> Option<ClassifierVerdict> {
        let (txn_id, features) = self.features.lock().take_latest()?;
        if !self.config.classifier_enabled {
            return None;
        }
        let classifier = self.classifier.as_ref()?;

        match classifier.predict(&features) {
            Ok(positive) => Some(ClassifierVerdict {
                txn_id,
                positive,
                features,
            }),
            Err(e) => {
                self.stats
                    .classifier_failures
                    .fetch_add(1, AtomicOrdering::Relaxed);
                warn!(classifier = classifier.name(), error = %e, "classifier unavailable");
                None
            }
        }
    }

    /// Hands a record to the store, bounded by the configured timeout.
    ///
    /// On success the record is marked acknowledged in the dedup window.
    pub async fn emit(&self, record: DeadlockRecord) -> StoreResult<StoreAck> {
        let deadlock_id = record.deadlock_id;
        let timeout = self.config.store_timeout();

        let result = match tokio::time::timeout(timeout, self.store.insert(record)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(ack) => {
                self.dedup.lock().ack(deadlock_id);
                self.stats
                    .records_emitted
                    .fetch_add(1, AtomicOrdering::Relaxed);
                info!(%deadlock_id, duplicate = ack.duplicate, "deadlock record stored");
                Ok(ack)
            }
            Err(e) => {
                self.stats
                    .emission_failures
                    .fetch_add(1, AtomicOrdering::Relaxed);
                warn!(%deadlock_id, error = %e, "failed to store deadlock record");
                Err(e)
            }
        }
    }

    async fn emit_or_fail(&self, record: DeadlockRecord) -> DetectResult<StoreAck> {
        let deadlock_id = record.deadlock_id;
        self.emit(record)
            .await
            .map_err(|source| DetectError::Emission {
                deadlock_id,
                source,
            })
    }

    /// Returns the wait-for graph.
    pub fn graph(&self) -> &WaitForGraph {
        &self.graph
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Returns the number of events held back by the reorder buffer.
    pub fn pending_events(&self) -> usize {
        self.reorder.lock().len()
    }

    /// Returns the newest event timestamp ingested so far, late events
    /// excluded. Replays tick against this instead of the wall clock.
    pub fn latest_event_time(&self) -> Timestamp {
        self.reorder.lock().max_seen()
    }

    /// Returns the number of records waiting for a store acknowledgement.
    pub fn pending_records(&self) -> usize {
        self.dedup.lock().pending_count()
    }

    /// Returns engine statistics.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Returns cycle detector statistics.
    pub fn detector_stats(&self) -> &DetectorStats {
        self.decision.detector_stats()
    }
}

impl fmt::Debug for DeadlockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockEngine")
            .field("graph", &self.graph)
            .field("pending_events", &self.pending_events())
            .field("pending_records", &self.pending_records())
            .field("classifier", &self.classifier.as_ref().map(|c| c.name()))
            .finish()
    }
}
