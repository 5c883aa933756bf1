//! Lock events consumed by the detector.
//!
//! A lock manager reports three things about a `(transaction, resource)`
//! pair: the transaction holds it, the transaction is waiting for it, or
//! the transaction let go of it (either the lock or the wait).
//!
//! ```text
//! T1 Held R1        T1 owns R1
//! T2 Requested R1   T2 blocked on R1  =>  edge T2 -> T1
//! T1 Released R1    edge T2 -> T1 disappears
//! ```
//!
//! Events usually arrive as JSON lines produced by a lock-manager adapter,
//! see [`RawLockEvent`].

mod reorder;

pub use reorder::{Admission, ReorderBuffer};

use std::fmt;
use std::str::FromStr;

use nexus_common::types::{ResourceId, Timestamp, TxnId};
use serde::{Deserialize, Serialize};

use crate::error::{EventError, EventResult};

/// What happened to a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockEventKind {
    /// The transaction owns the resource.
    Held,
    /// The transaction is waiting for the resource.
    Requested,
    /// The transaction no longer holds or waits for the resource.
    Released,
}

impl fmt::Display for LockEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockEventKind::Held => write!(f, "held"),
            LockEventKind::Requested => write!(f, "requested"),
            LockEventKind::Released => write!(f, "released"),
        }
    }
}

impl FromStr for LockEventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "held" => Ok(LockEventKind::Held),
            "requested" => Ok(LockEventKind::Requested),
            "released" => Ok(LockEventKind::Released),
            other => Err(EventError::malformed(format!("unknown event kind {:?}", other))),
        }
    }
}

/// A single observed lock event.
///
/// Events are immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockEvent {
    txn_id: TxnId,
    resource: ResourceId,
    kind: LockEventKind,
    timestamp: Timestamp,
}

impl LockEvent {
    /// Creates a new lock event.
    pub fn new(
        txn_id: TxnId,
        resource: ResourceId,
        kind: LockEventKind,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            txn_id,
            resource,
            kind,
            timestamp,
        }
    }

    /// Creates a `Held` event.
    pub fn held(txn_id: TxnId, resource: impl Into<ResourceId>, timestamp: Timestamp) -> Self {
        Self::new(txn_id, resource.into(), LockEventKind::Held, timestamp)
    }

    /// Creates a `Requested` event.
    pub fn requested(txn_id: TxnId, resource: impl Into<ResourceId>, timestamp: Timestamp) -> Self {
        Self::new(txn_id, resource.into(), LockEventKind::Requested, timestamp)
    }

    /// Creates a `Released` event.
    pub fn released(txn_id: TxnId, resource: impl Into<ResourceId>, timestamp: Timestamp) -> Self {
        Self::new(txn_id, resource.into(), LockEventKind::Released, timestamp)
    }

    /// Decodes and validates one JSON-encoded [`RawLockEvent`].
    pub fn from_json(line: &str) -> EventResult<Self> {
        let raw: RawLockEvent = serde_json::from_str(line)?;
        Self::try_from(raw)
    }

    /// Returns the transaction ID.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Returns the resource.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Returns the event kind.
    pub fn kind(&self) -> LockEventKind {
        self.kind
    }

    /// Returns when the lock manager observed the event.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl fmt::Display for LockEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @{}",
            self.txn_id, self.kind, self.resource, self.timestamp
        )
    }
}

/// Wire shape of a lock event before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLockEvent {
    /// Transaction UUID in hyphenated form.
    pub transaction_id: String,
    /// Resource identifier.
    pub resource_id: String,
    /// `held`, `requested` or `released`.
    pub kind: String,
    /// Microseconds since Unix epoch.
    pub timestamp_micros: u64,
}

impl TryFrom<RawLockEvent> for LockEvent {
    type Error = EventError;

    fn try_from(raw: RawLockEvent) -> Result<Self, Self::Error> {
        let txn_id: TxnId = raw.transaction_id.parse().map_err(|e| {
            EventError::malformed(format!(
                "invalid transaction id {:?}: {}",
                raw.transaction_id, e
            ))
        })?;
        if !txn_id.is_valid() {
            return Err(EventError::malformed("nil transaction id"));
        }

        let resource_id = raw.resource_id.trim();
        if resource_id.is_empty() {
            return Err(EventError::malformed("empty resource id"));
        }

        let kind: LockEventKind = raw.kind.parse()?;

        Ok(LockEvent::new(
            txn_id,
            ResourceId::from_name(resource_id),
            kind,
            Timestamp::from_micros(raw.timestamp_micros),
        ))
    }
}

impl From<&LockEvent> for RawLockEvent {
    fn from(event: &LockEvent) -> Self {
        Self {
            transaction_id: event.txn_id.to_string(),
            resource_id: event.resource.to_string(),
            kind: event.kind.to_string(),
            timestamp_micros: event.timestamp.as_micros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(txn: &str, resource: &str, kind: &str) -> RawLockEvent {
        RawLockEvent {
            transaction_id: txn.to_string(),
            resource_id: resource.to_string(),
            kind: kind.to_string(),
            timestamp_micros: 1_000,
        }
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("held".parse::<LockEventKind>().unwrap(), LockEventKind::Held);
        assert_eq!(
            " Requested ".parse::<LockEventKind>().unwrap(),
            LockEventKind::Requested
        );
        assert_eq!(
            "RELEASED".parse::<LockEventKind>().unwrap(),
            LockEventKind::Released
        );
        assert!("granted".parse::<LockEventKind>().is_err());
    }

    #[test]
    fn test_raw_event_conversion() {
        let event = LockEvent::try_from(raw(
            "4e9519ef-27c0-4075-bc20-c51383595ec0",
            "resource_1",
            "held",
        ))
        .unwrap();

        assert_eq!(event.kind(), LockEventKind::Held);
        assert_eq!(event.resource(), &ResourceId::from_name("resource_1"));
        assert_eq!(event.timestamp(), Timestamp::from_micros(1_000));

        let back = RawLockEvent::from(&event);
        assert_eq!(back.kind, "held");
        assert_eq!(back.transaction_id, "4e9519ef-27c0-4075-bc20-c51383595ec0");
    }

    #[test]
    fn test_malformed_events() {
        let bad_txn = LockEvent::try_from(raw("txn-1", "resource_1", "held"));
        assert!(matches!(bad_txn, Err(EventError::MalformedEvent { .. })));

        let nil_txn = LockEvent::try_from(raw(
            "00000000-0000-0000-0000-000000000000",
            "resource_1",
            "held",
        ));
        assert!(matches!(nil_txn, Err(EventError::MalformedEvent { .. })));

        let empty_resource = LockEvent::try_from(raw(
            "4e9519ef-27c0-4075-bc20-c51383595ec0",
            "  ",
            "held",
        ));
        assert!(matches!(empty_resource, Err(EventError::MalformedEvent { .. })));

        let bad_kind = LockEvent::try_from(raw(
            "4e9519ef-27c0-4075-bc20-c51383595ec0",
            "resource_1",
            "upgraded",
        ));
        assert!(matches!(bad_kind, Err(EventError::MalformedEvent { .. })));
    }

    #[test]
    fn test_from_json() {
        let line = r#"{"transaction_id":"acfb8aa7-f77b-424f-b238-ad79aa89146f","resource_id":"resource_2","kind":"requested","timestamp_micros":42}"#;
        let event = LockEvent::from_json(line).unwrap();
        assert_eq!(event.kind(), LockEventKind::Requested);
        assert_eq!(event.timestamp().as_micros(), 42);

        assert!(matches!(
            LockEvent::from_json("{not json"),
            Err(EventError::Decode { .. })
        ));
    }
}
