//! Hybrid deadlock decision.
//!
//! Three independent signals, any one of which is enough:
//!
//! 1. the wait-for graph has a cycle
//! 2. the classifier flags the most recent transaction
//! 3. some blocked transaction has waited at least the threshold
//!
//! With a cycle, the deadlock is the cycle's vertex set. Otherwise it is the
//! single transaction that triggered the positive signal.

mod dedup;

pub use dedup::DedupWindow;

use std::collections::BTreeSet;
use std::time::Duration;

use nexus_common::types::{Timestamp, TxnId};

use crate::classifier::ClassifierVerdict;
use crate::cycle::{Cycle, CycleDetector, DetectorStats};
use crate::graph::GraphSnapshot;

/// How long a blocked transaction has been waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSample {
    /// The blocked transaction.
    pub txn_id: TxnId,
    /// Time since its oldest outstanding request.
    pub waited: Duration,
}

/// Computes the wait time of every blocked transaction in the snapshot.
pub fn wait_samples(snapshot: &GraphSnapshot, now: Timestamp) -> Vec<WaitSample> {
    snapshot
        .waiting_since()
        .iter()
        .map(|(&txn_id, &since)| WaitSample {
            txn_id,
            waited: now.saturating_duration_since(since),
        })
        .collect()
}

/// Which signals fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    /// A cycle was found.
    pub cycle: bool,
    /// The classifier was positive.
    pub classifier: bool,
    /// A wait exceeded the threshold.
    pub wait: bool,
}

impl Signals {
    /// Returns true if any signal fired.
    pub fn any(&self) -> bool {
        self.cycle || self.classifier || self.wait
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlockVerdict {
    signals: Signals,
    cycle: Option<Cycle>,
    trigger: Option<TxnId>,
    longest_wait: Option<WaitSample>,
}

impl DeadlockVerdict {
    /// Returns true if a deadlock was detected.
    pub fn is_positive(&self) -> bool {
        self.signals.any()
    }

    /// Returns which signals fired.
    pub fn signals(&self) -> Signals {
        self.signals
    }

    /// Returns the cycle, if one was found.
    pub fn cycle(&self) -> Option<&Cycle> {
        self.cycle.as_ref()
    }

    /// Returns the longest current wait, if any transaction is blocked.
    pub fn longest_wait(&self) -> Option<WaitSample> {
        self.longest_wait
    }

    /// Returns the transactions in the deadlock: the cycle's vertex set, or
    /// the triggering transaction. Empty for a negative verdict.
    pub fn involved_transactions(&self) -> BTreeSet<TxnId> {
        if !self.is_positive() {
            return BTreeSet::new();
        }
        match (&self.cycle, self.trigger) {
            (Some(cycle), _) => cycle.vertex_set(),
            (None, Some(txn)) => BTreeSet::from([txn]),
            (None, None) => BTreeSet::new(),
        }
    }
}

fn is_covered(involved: &BTreeSet<TxnId>, remembered: &[BTreeSet<TxnId>]) -> bool {
    remembered.iter().any(|set| involved.is_subset(set))
}

/// Fuses the cycle, classifier and wait-time signals.
#[derive(Debug)]
pub struct HybridDecisionEngine {
    detector: CycleDetector,
    wait_threshold: Duration,
}

impl HybridDecisionEngine {
    /// Creates a decision engine with the given wait threshold.
    pub fn new(wait_threshold: Duration) -> Self {
        Self {
            detector: CycleDetector::new(),
            wait_threshold,
        }
    }

    /// Evaluates all three signals.
    pub fn evaluate(
        &self,
        snapshot: &GraphSnapshot,
        classifier: Option<&ClassifierVerdict>,
        waits: &[WaitSample],
    ) -> DeadlockVerdict {
        self.evaluate_excluding(snapshot, &[], classifier, waits)
    }

    /// Like [`evaluate`](Self::evaluate), but prefers detections that no
    /// `remembered` set already covers.
    ///
    /// Cycles are searched first among transactions outside every
    /// remembered set, then among each remembered set plus outsiders. Long
    /// waiters outside every remembered set win over covered ones. If only
    /// covered detections exist, one of those is reported so the caller can
    /// suppress it.
    pub fn evaluate_excluding(
        &self,
        snapshot: &GraphSnapshot,
        remembered: &[BTreeSet<TxnId>],
        classifier: Option<&ClassifierVerdict>,
        waits: &[WaitSample],
    ) -> DeadlockVerdict {
        let cycle = self.find_new_cycle(snapshot, remembered);

        let classifier_positive = classifier.filter(|v| v.positive);
        let longest_wait = waits.iter().copied().max_by_key(|w| (w.waited, w.txn_id));
        let long_waits: Vec<WaitSample> = waits
            .iter()
            .copied()
            .filter(|w| w.waited >= self.wait_threshold)
            .collect();
        let long_wait = long_waits
            .iter()
            .copied()
            .filter(|w| !is_covered(&BTreeSet::from([w.txn_id]), remembered))
            .max_by_key(|w| (w.waited, w.txn_id))
            .or_else(|| long_waits.iter().copied().max_by_key(|w| (w.waited, w.txn_id)));

        let signals = Signals {
            cycle: cycle.is_some(),
            classifier: classifier_positive.is_some(),
            wait: long_wait.is_some(),
        };
        let trigger = classifier_positive
            .map(|v| v.txn_id)
            .or(long_wait.map(|w| w.txn_id));

        DeadlockVerdict {
            signals,
            cycle,
            trigger,
            longest_wait,
        }
    }

    fn find_new_cycle(
        &self,
        snapshot: &GraphSnapshot,
        remembered: &[BTreeSet<TxnId>],
    ) -> Option<Cycle> {
        if remembered.is_empty() {
            return self.detector.find_cycle(snapshot);
        }

        let known: BTreeSet<TxnId> = remembered.iter().flatten().copied().collect();
        if let Some(cycle) = self.detector.find_cycle_excluding(snapshot, &known) {
            return Some(cycle);
        }

        for set in remembered {
            let excluded: BTreeSet<TxnId> = known.difference(set).copied().collect();
            if let Some(cycle) = self.detector.find_cycle_excluding(snapshot, &excluded) {
                if !is_covered(&cycle.vertex_set(), remembered) {
                    return Some(cycle);
                }
            }
        }

        self.detector.find_cycle(snapshot)
    }

    /// Returns the wait threshold.
    pub fn wait_threshold(&self) -> Duration {
        self.wait_threshold
    }

    /// Returns cycle detector statistics.
    pub fn detector_stats(&self) -> &DetectorStats {
        self.detector.stats()
    }
}
