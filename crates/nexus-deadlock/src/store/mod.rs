//! Deadlock record persistence.
//!
//! The engine hands every detected deadlock to a [`DeadlockStore`]. Records
//! are keyed by [`DeadlockId`] and inserts are idempotent, so re-emitting a
//! record after a failed or timed-out call never duplicates it.
//!
//! - `MemoryStore`: `DashMap`-backed, with fault injection for tests
//! - `FileStore`: append-only JSON-lines log, replayed on open
//!
//! The persisted shape is the compatibility contract with downstream
//! resolution tooling:
//!
//! ```text
//! deadlock_id            UUID
//! detected_at            microseconds since epoch
//! involved_transactions  list of transaction UUIDs
//! status                 "active" | "resolved"
//! ```

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use nexus_common::types::{DeadlockId, Timestamp, TxnId};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Lifecycle state of a deadlock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlockStatus {
    /// Detected and not yet resolved.
    Active,
    /// A victim was aborted and the deadlock is gone.
    Resolved,
}

impl fmt::Display for DeadlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlockStatus::Active => write!(f, "active"),
            DeadlockStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// A detected deadlock.
///
/// The engine creates each record once and never mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockRecord {
    /// Idempotency key.
    pub deadlock_id: DeadlockId,
    /// When the engine detected the deadlock.
    pub detected_at: Timestamp,
    /// Transactions in the deadlock, sorted and de-duplicated.
    pub involved_transactions: Vec<TxnId>,
    /// Lifecycle state.
    pub status: DeadlockStatus,
}

impl DeadlockRecord {
    /// Creates an `Active` record with a fresh ID.
    pub fn new(involved: impl IntoIterator<Item = TxnId>, detected_at: Timestamp) -> Self {
        let involved: BTreeSet<TxnId> = involved.into_iter().collect();
        Self {
            deadlock_id: DeadlockId::generate(),
            detected_at,
            involved_transactions: involved.into_iter().collect(),
            status: DeadlockStatus::Active,
        }
    }

    /// Returns true if the transaction is part of this deadlock.
    pub fn involves(&self, txn_id: &TxnId) -> bool {
        self.involved_transactions.binary_search(txn_id).is_ok()
    }
}

/// Acknowledgement of a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreAck {
    /// The record that was written.
    pub deadlock_id: DeadlockId,
    /// True if the store already had the record and nothing was written.
    pub duplicate: bool,
}

/// Durable keyed storage for deadlock records.
///
/// Callers bound every call with their own timeout; implementations only
/// need to be cancel-safe between writes.
pub trait DeadlockStore: Send + Sync {
    /// Inserts a record. Inserting an ID that already exists is a no-op
    /// acknowledged with `duplicate = true`.
    fn insert(
        &self,
        record: DeadlockRecord,
    ) -> Pin<Box<dyn Future<Output = StoreResult<StoreAck>> + Send + '_>>;

    /// Changes the status of an existing record.
    ///
    /// Not used by the engine; exposed for resolution tooling.
    fn update_status(
        &self,
        deadlock_id: DeadlockId,
        status: DeadlockStatus,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + '_>>;

    /// Looks up a record.
    fn get(
        &self,
        deadlock_id: DeadlockId,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<DeadlockRecord>>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sorts_and_dedups_transactions() {
        let record = DeadlockRecord::new(
            [TxnId::from_u128(3), TxnId::from_u128(1), TxnId::from_u128(3)],
            Timestamp::from_secs(1),
        );
        assert_eq!(
            record.involved_transactions,
            vec![TxnId::from_u128(1), TxnId::from_u128(3)]
        );
        assert_eq!(record.status, DeadlockStatus::Active);
        assert!(record.involves(&TxnId::from_u128(3)));
        assert!(!record.involves(&TxnId::from_u128(2)));
    }

    #[test]
    fn test_record_json_shape() {
        let record = DeadlockRecord::new([TxnId::from_u128(1)], Timestamp::from_micros(42));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "active");
        assert_eq!(json["detected_at"], 42);
        assert_eq!(
            json["involved_transactions"][0],
            "00000000-0000-0000-0000-000000000001"
        );
        assert_eq!(json["deadlock_id"], record.deadlock_id.to_string());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DeadlockStatus::Active.to_string(), "active");
        assert_eq!(DeadlockStatus::Resolved.to_string(), "resolved");
    }
}
