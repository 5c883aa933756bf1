//! Append-only file record store.
//!
//! Every write is one JSON line:
//!
//! ```text
//! {"op":"insert","record":{"deadlock_id":"...","detected_at":...,"involved_transactions":[...],"status":"active"}}
//! {"op":"update_status","deadlock_id":"...","status":"resolved"}
//! ```
//!
//! Opening the store replays the log to rebuild the ID index, so inserts
//! stay idempotent across restarts. A torn final line (crash mid-append) is
//! ignored; corruption anywhere else is an error.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use nexus_common::types::DeadlockId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DeadlockRecord, DeadlockStatus, DeadlockStore, StoreAck};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Insert {
        record: DeadlockRecord,
    },
    UpdateStatus {
        deadlock_id: DeadlockId,
        status: DeadlockStatus,
    },
}

/// A JSON-lines record store.
pub struct FileStore {
    path: PathBuf,
    /// Serializes appends.
    file: Mutex<File>,
    index: RwLock<HashMap<DeadlockId, DeadlockRecord>>,
}

impl FileStore {
    /// Opens (or creates) the log at `path` and replays it.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let index = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Self::replay(&path, &content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(path = %path.display(), records = index.len(), "opened deadlock record log");

        Ok(Self {
            path,
            file: Mutex::new(file),
            index: RwLock::new(index),
        })
    }

    fn replay(path: &Path, content: &str) -> StoreResult<HashMap<DeadlockId, DeadlockRecord>> {
        let mut index = HashMap::new();
        let lines: Vec<&str> = content.lines().collect();

        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) if n + 1 == lines.len() => {
                    warn!(path = %path.display(), line = n + 1, error = %e, "ignoring torn record log tail");
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            match entry {
                LogEntry::Insert { record } => {
                    index.entry(record.deadlock_id).or_insert(record);
                }
                LogEntry::UpdateStatus {
                    deadlock_id,
                    status,
                } => {
                    if let Some(record) = index.get_mut(&deadlock_id) {
                        record.status = status;
                    }
                }
            }
        }
        Ok(index)
    }

    async fn append(file: &mut File, entry: &LogEntry) -> StoreResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Returns the log path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Returns all records ordered by detection time.
    pub fn records(&self) -> Vec<DeadlockRecord> {
        let mut records: Vec<_> = self.index.read().values().cloned().collect();
        records.sort_by_key(|r| (r.detected_at, r.deadlock_id));
        records
    }
}

impl DeadlockStore for FileStore {
    fn insert(
        &self,
        record: DeadlockRecord,
    ) -> Pin<Box<dyn Future<Output = StoreResult<StoreAck>> + Send + '_>> {
        Box::pin(async move {
            let deadlock_id = record.deadlock_id;
            let mut file = self.file.lock().await;

            if self.index.read().contains_key(&deadlock_id) {
                return Ok(StoreAck {
                    deadlock_id,
                    duplicate: true,
                });
            }

            let entry = LogEntry::Insert { record };
            Self::append(&mut file, &entry).await?;
            if let LogEntry::Insert { record } = entry {
                self.index.write().insert(deadlock_id, record);
            }
            Ok(StoreAck {
                deadlock_id,
                duplicate: false,
            })
        })
    }

    fn update_status(
        &self,
        deadlock_id: DeadlockId,
        status: DeadlockStatus,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + '_>> {
        Box::pin(async move {
            let mut file = self.file.lock().await;

            if !self.index.read().contains_key(&deadlock_id) {
                return Err(StoreError::NotFound { deadlock_id });
            }

            Self::append(
                &mut file,
                &LogEntry::UpdateStatus {
                    deadlock_id,
                    status,
                },
            )
            .await?;
            if let Some(record) = self.index.write().get_mut(&deadlock_id) {
                record.status = status;
            }
            Ok(())
        })
    }

    fn get(
        &self,
        deadlock_id: DeadlockId,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<DeadlockRecord>>> + Send + '_>> {
        Box::pin(async move { Ok(self.index.read().get(&deadlock_id).cloned()) })
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_common::types::{Timestamp, TxnId};
    use tempfile::TempDir;

    fn record(id: u128) -> DeadlockRecord {
        DeadlockRecord::new(
            [TxnId::from_u128(id), TxnId::from_u128(id + 1)],
            Timestamp::from_secs(id as u64),
        )
    }

    #[tokio::test]
    async fn test_insert_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deadlocks.jsonl");

        let first = record(1);
        let second = record(5);
        {
            let store = FileStore::open(&path).await.unwrap();
            assert!(store.is_empty());
            store.insert(first.clone()).await.unwrap();
            store.insert(second.clone()).await.unwrap();
            store
                .update_status(first.deadlock_id, DeadlockStatus::Resolved)
                .await
                .unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.len(), 2);
        let reloaded = store.get(first.deadlock_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, DeadlockStatus::Resolved);
        assert_eq!(store.records()[1], second);

        // Re-inserting after restart is acknowledged as a duplicate.
        let ack = store.insert(second).await.unwrap();
        assert!(ack.duplicate);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_log_line_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deadlocks.jsonl");
        let store = FileStore::open(&path).await.unwrap();
        let record = record(1);
        store.insert(record.clone()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(value["op"], "insert");
        assert_eq!(value["record"]["status"], "active");
        assert_eq!(value["record"]["deadlock_id"], record.deadlock_id.to_string());
    }

    #[tokio::test]
    async fn test_update_unknown_record() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("deadlocks.jsonl"))
            .await
            .unwrap();
        let result = store
            .update_status(DeadlockId::generate(), DeadlockStatus::Resolved)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deadlocks.jsonl");
        let record = record(1);
        {
            let store = FileStore::open(&path).await.unwrap();
            store.insert(record.clone()).await.unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(r#"{"op":"insert","rec"#);
        std::fs::write(&path, content).unwrap();

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(record.deadlock_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_middle_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deadlocks.jsonl");
        let line = serde_json::to_string(&LogEntry::Insert { record: record(1) }).unwrap();
        std::fs::write(&path, format!("garbage\n{}\n", line)).unwrap();

        let result = FileStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Serialization { .. })));
    }
}
