//! In-memory record store.
//!
//! Used by tests and by embedders that forward records elsewhere. Supports
//! injected failures and latency to exercise the engine's timeout and
//! re-emission paths.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use nexus_common::types::DeadlockId;
use parking_lot::Mutex;

use super::{DeadlockRecord, DeadlockStatus, DeadlockStore, StoreAck};
use crate::error::{StoreError, StoreResult};

/// A `DashMap`-backed record store.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<DeadlockId, DeadlockRecord>,
    /// Number of upcoming calls that fail.
    fail_next: AtomicU32,
    /// Artificial latency added to every call.
    delay: Mutex<Option<Duration>>,
    /// Insert calls that reached the store, successful or not.
    insert_calls: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Adds latency to every call, or removes it with `None`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns all records ordered by detection time.
    pub fn records(&self) -> Vec<DeadlockRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| (r.detected_at, r.deadlock_id));
        records
    }

    /// Returns the number of insert calls received.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::Relaxed)
    }

    async fn before_call(&self) -> StoreResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::unavailable("injected failure"));
        }
        Ok(())
    }
}

impl DeadlockStore for MemoryStore {
    fn insert(
        &self,
        record: DeadlockRecord,
    ) -> Pin<Box<dyn Future<Output = StoreResult<StoreAck>> + Send + '_>> {
        Box::pin(async move {
            self.insert_calls.fetch_add(1, Ordering::Relaxed);
            self.before_call().await?;

            let deadlock_id = record.deadlock_id;
            let mut duplicate = true;
            self.records.entry(deadlock_id).or_insert_with(|| {
                duplicate = false;
                record
            });
            Ok(StoreAck {
                deadlock_id,
                duplicate,
            })
        })
    }

    fn update_status(
        &self,
        deadlock_id: DeadlockId,
        status: DeadlockStatus,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.before_call().await?;
            match self.records.get_mut(&deadlock_id) {
                Some(mut record) => {
                    record.status = status;
                    Ok(())
                }
                None => Err(StoreError::NotFound { deadlock_id }),
            }
        })
    }

    fn get(
        &self,
        deadlock_id: DeadlockId,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<DeadlockRecord>>> + Send + '_>> {
        Box::pin(async move {
            self.before_call().await?;
            Ok(self.records.get(&deadlock_id).map(|r| r.value().clone()))
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.records.len())
            .field("fail_next", &self.fail_next.load(Ordering::Relaxed))
            .finish()
    }
}
