//! Learned anomaly signal.
//!
//! The engine does not train anything. It derives a small feature vector
//! from every applied lock event and asks an injected [`AnomalyClassifier`]
//! whether the most recent one looks like a deadlock.
//!
//! | feature              | value                                         |
//! |----------------------|-----------------------------------------------|
//! | `lock_held`          | event kind is `Held`                          |
//! | `lock_requested`     | event kind is `Requested`                     |
//! | `time_interval_secs` | seconds since the transaction's previous event |

mod ensemble;

pub use ensemble::{Aggregation, SplitFeature, TreeEnsemble, TreeNode};

use std::collections::{HashMap, HashSet};
use std::fmt;

use nexus_common::types::{ResourceId, Timestamp, TxnId};
use serde::{Deserialize, Serialize};

use crate::error::ClassifierResult;
use crate::event::{LockEvent, LockEventKind};

/// Classifier input for one lock event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TxnFeatures {
    /// The event reported a held lock.
    pub lock_held: bool,
    /// The event reported a lock request.
    pub lock_requested: bool,
    /// Seconds since the transaction's previous observed event.
    pub time_interval_secs: f64,
}

/// A stateless `features -> bool` prediction.
///
/// Implementations must be cheap and non-blocking; they are called once per
/// detection tick. Returning an error is treated as "no positive signal".
pub trait AnomalyClassifier: Send + Sync {
    /// Returns true if the features look like a deadlocked transaction.
    fn predict(&self, features: &TxnFeatures) -> ClassifierResult<bool>;

    /// Returns a short name for logging.
    fn name(&self) -> &str {
        "classifier"
    }
}

impl<F> AnomalyClassifier for F
where
    F: Fn(&TxnFeatures) -> ClassifierResult<bool> + Send + Sync,
{
    fn predict(&self, features: &TxnFeatures) -> ClassifierResult<bool> {
        self(features)
    }
}

/// The classifier's answer for one transaction, scoped to a single tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierVerdict {
    /// Transaction the features belong to.
    pub txn_id: TxnId,
    /// The prediction.
    pub positive: bool,
    /// The features the prediction was made on.
    pub features: TxnFeatures,
}

#[derive(Debug)]
struct TxnTrack {
    last_seen: Timestamp,
    open: HashSet<ResourceId>,
}

/// Derives classifier features from the event stream.
///
/// A transaction is forgotten once it neither holds nor waits for anything.
#[derive(Default)]
pub struct FeatureTracker {
    txns: HashMap<TxnId, TxnTrack>,
    latest: Option<(TxnId, TxnFeatures)>,
}

impl FeatureTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an applied event and returns its feature vector.
    pub fn observe(&mut self, event: &LockEvent) -> TxnFeatures {
        let txn_id = event.txn_id();
        let at = event.timestamp();

        let interval = match self.txns.get(&txn_id) {
            Some(track) => at.saturating_duration_since(track.last_seen),
            None => std::time::Duration::ZERO,
        };

        let track = self.txns.entry(txn_id).or_insert_with(|| TxnTrack {
            last_seen: at,
            open: HashSet::new(),
        });
        track.last_seen = track.last_seen.max(at);
        match event.kind() {
            LockEventKind::Held | LockEventKind::Requested => {
                track.open.insert(event.resource().clone());
            }
            LockEventKind::Released => {
                track.open.remove(event.resource());
            }
        }
        if track.open.is_empty() {
            self.txns.remove(&txn_id);
        }

        let features = TxnFeatures {
            lock_held: event.kind() == LockEventKind::Held,
            lock_requested: event.kind() == LockEventKind::Requested,
            time_interval_secs: interval.as_secs_f64(),
        };
        self.latest = Some((txn_id, features));
        features
    }

    /// Takes the most recent feature vector, if any event arrived since the
    /// last call.
    pub fn take_latest(&mut self) -> Option<(TxnId, TxnFeatures)> {
        self.latest.take()
    }

    /// Returns the number of transactions with open lock state.
    pub fn tracked(&self) -> usize {
        self.txns.len()
    }
}

impl fmt::Debug for FeatureTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureTracker")
            .field("tracked", &self.txns.len())
            .field("has_latest", &self.latest.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifierError;

    fn ts(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn test_first_event_has_zero_interval() {
        let mut tracker = FeatureTracker::new();
        let features = tracker.observe(&LockEvent::held(TxnId::from_u128(1), "R1", ts(100)));

        assert!(features.lock_held);
        assert!(!features.lock_requested);
        assert_eq!(features.time_interval_secs, 0.0);
    }

    #[test]
    fn test_interval_since_previous_event() {
        let mut tracker = FeatureTracker::new();
        let txn = TxnId::from_u128(1);
        tracker.observe(&LockEvent::held(txn, "R1", ts(100)));
        tracker.observe(&LockEvent::held(TxnId::from_u128(2), "R2", ts(101)));
        let features = tracker.observe(&LockEvent::requested(txn, "R2", ts(112)));

        assert!(features.lock_requested);
        assert_eq!(features.time_interval_secs, 12.0);
        assert_eq!(tracker.take_latest(), Some((txn, features)));
        assert_eq!(tracker.take_latest(), None);
    }

    #[test]
    fn test_out_of_order_interval_saturates() {
        let mut tracker = FeatureTracker::new();
        let txn = TxnId::from_u128(1);
        tracker.observe(&LockEvent::held(txn, "R1", ts(100)));
        let features = tracker.observe(&LockEvent::requested(txn, "R2", ts(90)));
        assert_eq!(features.time_interval_secs, 0.0);
    }

    #[test]
    fn test_released_transactions_are_forgotten() {
        let mut tracker = FeatureTracker::new();
        let txn = TxnId::from_u128(1);
        tracker.observe(&LockEvent::held(txn, "R1", ts(1)));
        tracker.observe(&LockEvent::requested(txn, "R2", ts(2)));
        assert_eq!(tracker.tracked(), 1);

        tracker.observe(&LockEvent::released(txn, "R1", ts(3)));
        assert_eq!(tracker.tracked(), 1);
        tracker.observe(&LockEvent::released(txn, "R2", ts(4)));
        assert_eq!(tracker.tracked(), 0);

        // A new event starts from scratch.
        let features = tracker.observe(&LockEvent::held(txn, "R3", ts(50)));
        assert_eq!(features.time_interval_secs, 0.0);
    }

    #[test]
    fn test_closure_classifier() {
        let classifier = |features: &TxnFeatures| -> ClassifierResult<bool> {
            if features.time_interval_secs.is_nan() {
                return Err(ClassifierError::unavailable("nan"));
            }
            Ok(features.lock_requested && features.time_interval_secs > 5.0)
        };

        let features = TxnFeatures {
            lock_held: false,
            lock_requested: true,
            time_interval_secs: 6.0,
        };
        assert!(classifier.predict(&features).unwrap());
        assert_eq!(classifier.name(), "classifier");
    }
}
