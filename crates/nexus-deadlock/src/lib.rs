//! # nexus-deadlock
//!
//! Online transaction deadlock detection for NexusDB.
//!
//! This crate watches a lock manager's event feed and records deadlocks:
//!
//! - **Wait-For Graph**: Built from `Held`/`Requested`/`Released` events,
//!   with copy-on-read snapshots so scans never block ingestion.
//!
//! - **Cycle Detection**: Iterative three-color depth-first search that
//!   reports exactly the transactions on the cycle.
//!
//! - **Hybrid Decision**: A cycle, a positive classifier signal, or an
//!   over-long wait each count as a deadlock.
//!
//! - **Record Emission**: Each distinct deadlock is stored once, keyed by a
//!   fresh ID, with failed writes retried on the next tick.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         DeadlockEngine                           │
//! │                                                                  │
//! │  LockEvent ──▶ ReorderBuffer ──▶ WaitForGraph ──▶ GraphSnapshot  │
//! │                                       │                │         │
//! │                                       ▼                ▼         │
//! │                               FeatureTracker    CycleDetector    │
//! │                                       │                │         │
//! │                                       ▼                ▼         │
//! │                            AnomalyClassifier ─▶ HybridDecision   │
//! │                                                        │         │
//! │                                                        ▼         │
//! │                                   DedupWindow ──▶ DeadlockStore  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use nexus_common::types::{Timestamp, TxnId};
//! use nexus_deadlock::{DeadlockEngine, DetectorConfig, LockEvent, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = DeadlockEngine::new(DetectorConfig::default(), store.clone())?;
//!
//! let (t1, t2) = (TxnId::generate(), TxnId::generate());
//! engine.ingest(LockEvent::held(t1, "R1", Timestamp::now()));
//! engine.ingest(LockEvent::held(t2, "R2", Timestamp::now()));
//! engine.ingest(LockEvent::requested(t1, "R2", Timestamp::now()));
//! engine.ingest(LockEvent::requested(t2, "R1", Timestamp::now()));
//!
//! let report = engine.tick().await?;
//! assert!(report.record.is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Lock events.
///
/// This module provides:
/// - [`event::LockEvent`]: A validated lock event
/// - [`event::RawLockEvent`]: The JSON wire shape
/// - [`event::ReorderBuffer`]: Bounded out-of-order tolerance
pub mod event;

/// Wait-for graph.
///
/// This module provides:
/// - [`graph::WaitForGraph`]: The mutable graph
/// - [`graph::GraphSnapshot`]: An immutable copy for traversal
pub mod graph;

/// Cycle detection.
pub mod cycle;

/// Classifier capability and feature tracking.
pub mod classifier;

/// Hybrid decision and de-duplication.
pub mod decision;

/// Deadlock record persistence.
///
/// This module provides:
/// - [`store::DeadlockStore`]: The store capability
/// - [`store::MemoryStore`]: In-memory store
/// - [`store::FileStore`]: Append-only JSON-lines store
pub mod store;

/// The detection service.
pub mod engine;

/// Detector configuration.
pub mod config;

/// Error types.
pub mod error;

// Re-export commonly used types

pub use classifier::{AnomalyClassifier, ClassifierVerdict, TreeEnsemble, TxnFeatures};
pub use config::DetectorConfig;
pub use cycle::{Cycle, CycleDetector};
pub use decision::{DeadlockVerdict, HybridDecisionEngine, Signals, WaitSample};
pub use engine::{DeadlockEngine, EngineStats, TickReport, TickStats};
pub use error::{
    ClassifierError, ClassifierResult, DetectError, DetectResult, EventError, EventResult,
    StoreError, StoreResult,
};
pub use event::{LockEvent, LockEventKind, RawLockEvent};
pub use graph::{GraphSnapshot, WaitForGraph};
pub use store::{DeadlockRecord, DeadlockStatus, DeadlockStore, FileStore, MemoryStore, StoreAck};
