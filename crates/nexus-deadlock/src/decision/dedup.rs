//! De-duplication of detected deadlocks.
//!
//! A persisting deadlock is seen again on every tick. The window remembers
//! each emitted record by its vertex set and suppresses any new detection
//! whose set is already covered by one it holds (equal, or a subset).
//! A detection that adds transactions to a remembered set, such as a cycle
//! closing over a transaction first flagged for waiting, is a new record.
//!
//! Entries move through two states:
//!
//! ```text
//! reserve ──▶ pending ──ack──▶ acked ──window elapsed──▶ (pruned)
//! ```
//!
//! Pending entries never expire: the record is re-emitted with the same ID
//! until the store acknowledges it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use nexus_common::types::{DeadlockId, Timestamp, TxnId};

use crate::store::DeadlockRecord;

#[derive(Debug, Clone)]
struct Entry {
    record: DeadlockRecord,
    acked: bool,
}

/// Remembers recently detected deadlocks.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    /// Keyed by the record's sorted transaction list.
    entries: BTreeMap<Vec<TxnId>, Entry>,
}

impl DedupWindow {
    /// Creates an empty window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: BTreeMap::new(),
        }
    }

    /// Returns true if some remembered deadlock contains every transaction
    /// of `involved`.
    pub fn covers(&self, involved: &BTreeSet<TxnId>) -> bool {
        self.entries
            .keys()
            .any(|key| involved.iter().all(|txn| key.binary_search(txn).is_ok()))
    }

    /// Returns the transaction set of every remembered deadlock.
    pub fn remembered(&self) -> Vec<BTreeSet<TxnId>> {
        self.entries
            .keys()
            .map(|key| key.iter().copied().collect())
            .collect()
    }

    /// Remembers a new record as pending. Returns false, and remembers
    /// nothing, if an existing entry covers it.
    pub fn reserve(&mut self, record: DeadlockRecord) -> bool {
        let involved: BTreeSet<TxnId> = record.involved_transactions.iter().copied().collect();
        if involved.is_empty() || self.covers(&involved) {
            return false;
        }
        self.entries.insert(
            record.involved_transactions.clone(),
            Entry {
                record,
                acked: false,
            },
        );
        true
    }

    /// Marks a record as stored. Returns false if it is unknown.
    pub fn ack(&mut self, deadlock_id: DeadlockId) -> bool {
        match self
            .entries
            .values_mut()
            .find(|entry| entry.record.deadlock_id == deadlock_id)
        {
            Some(entry) => {
                entry.acked = true;
                true
            }
            None => false,
        }
    }

    /// Returns the records still waiting for a store acknowledgement.
    pub fn pending(&self) -> Vec<DeadlockRecord> {
        self.entries
            .values()
            .filter(|entry| !entry.acked)
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Returns the number of unacknowledged records.
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|entry| !entry.acked).count()
    }

    /// Forgets acknowledged records detected at least one window before
    /// `now`. Returns how many were forgotten.
    pub fn prune(&mut self, now: Timestamp) -> usize {
        let window = self.window;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.acked || now < entry.record.detected_at.add(window));
        before - self.entries.len()
    }

    /// Returns the number of remembered records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ids: &[u128], secs: u64) -> DeadlockRecord {
        DeadlockRecord::new(
            ids.iter().map(|&id| TxnId::from_u128(id)),
            Timestamp::from_secs(secs),
        )
    }

    fn set(ids: &[u128]) -> BTreeSet<TxnId> {
        ids.iter().map(|&id| TxnId::from_u128(id)).collect()
    }

    #[test]
    fn test_reserve_suppresses_covered_sets() {
        let mut window = DedupWindow::new(Duration::from_secs(300));
        assert!(window.reserve(record(&[1, 2], 10)));
        assert!(!window.reserve(record(&[2, 1], 11)));
        assert!(!window.reserve(record(&[2], 12)));
        assert!(window.reserve(record(&[4, 5], 13)));

        assert!(window.covers(&set(&[1])));
        assert!(!window.covers(&set(&[1, 4])));
        assert!(!window.covers(&set(&[9])));
        assert_eq!(window.remembered(), vec![set(&[1, 2]), set(&[4, 5])]);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_superset_of_singleton_is_new() {
        let mut window = DedupWindow::new(Duration::from_secs(300));
        assert!(window.reserve(record(&[1], 10)));
        assert!(window.reserve(record(&[1, 2], 11)));
        assert!(window.reserve(record(&[2, 3], 12)));

        // Both singletons are now covered.
        assert!(!window.reserve(record(&[1], 13)));
        assert!(!window.reserve(record(&[3], 13)));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_pending_until_acked() {
        let mut window = DedupWindow::new(Duration::from_secs(300));
        let first = record(&[1, 2], 10);
        window.reserve(first.clone());
        assert_eq!(window.pending(), vec![first.clone()]);

        assert!(window.ack(first.deadlock_id));
        assert_eq!(window.pending_count(), 0);
        assert!(!window.ack(DeadlockId::generate()));
    }

    #[test]
    fn test_prune_expires_only_acked_entries() {
        let mut window = DedupWindow::new(Duration::from_secs(300));
        let acked = record(&[1, 2], 10);
        let pending = record(&[3, 4], 10);
        window.reserve(acked.clone());
        window.reserve(pending);
        window.ack(acked.deadlock_id);

        assert_eq!(window.prune(Timestamp::from_secs(309)), 0);
        assert_eq!(window.prune(Timestamp::from_secs(310)), 1);
        assert_eq!(window.len(), 1);

        // Pending records survive any amount of time.
        assert_eq!(window.prune(Timestamp::from_secs(1_000_000)), 0);
        assert_eq!(window.pending_count(), 1);

        // After expiry the same vertex set can be recorded again.
        assert!(window.reserve(record(&[1, 2], 400)));
    }
}
