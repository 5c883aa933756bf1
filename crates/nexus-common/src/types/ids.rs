//! Core identifier types for the deadlock detector.
//!
//! These types provide type-safe wrappers around the raw identifiers that
//! arrive from lock managers, preventing a transaction id from being passed
//! where a deadlock id or resource id is expected.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Transaction identifier - uniquely identifies a transaction.
///
/// Transaction IDs are 128-bit UUIDs assigned by the lock manager that
/// produced the event. They carry no ordering meaning; the `Ord` impl exists
/// so that graph snapshots iterate deterministically.
///
/// # Example
///
/// ```rust
/// use nexus_common::types::TxnId;
///
/// let txn = TxnId::from_u128(1);
/// assert!(txn.is_valid());
/// assert!(!TxnId::NIL.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct TxnId(Uuid);

impl TxnId {
    /// Nil transaction ID, used as a sentinel value.
    pub const NIL: Self = Self(Uuid::nil());

    /// Creates a new `TxnId` from a UUID.
    #[inline]
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Creates a fresh random transaction ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a `TxnId` from a raw 128-bit value.
    #[inline]
    #[must_use]
    pub const fn from_u128(id: u128) -> Self {
        Self(Uuid::from_u128(id))
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns the raw 128-bit value.
    #[inline]
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0.as_u128()
    }

    /// Checks if this is a valid (non-nil) transaction ID.
    #[inline]
    #[must_use]
    pub fn is_valid(self) -> bool {
        !self.0.is_nil()
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_nil() {
            write!(f, "TxnId(NIL)")
        } else {
            write!(f, "TxnId({})", self.0)
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxnId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl From<Uuid> for TxnId {
    #[inline]
    fn from(id: Uuid) -> Self {
        Self::new(id)
    }
}

impl From<TxnId> for Uuid {
    #[inline]
    fn from(id: TxnId) -> Self {
        id.0
    }
}

/// Deadlock identifier - the idempotency key of a deadlock record.
///
/// Every distinct deadlock occurrence gets a fresh random ID. Re-emitting a
/// record after a failed store call reuses the same ID so the store can
/// de-duplicate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct DeadlockId(Uuid);

impl DeadlockId {
    /// Creates a fresh random deadlock ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a `DeadlockId` from a UUID.
    #[inline]
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for DeadlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeadlockId({})", self.0)
    }
}

impl fmt::Display for DeadlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeadlockId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Identifies a lockable resource.
///
/// Resource IDs are opaque to the detector: two events refer to the same
/// resource iff their byte payloads are equal. Cloning is cheap.
///
/// # Example
///
/// ```rust
/// use nexus_common::types::ResourceId;
///
/// let r = ResourceId::from_name("resource_1");
/// assert_eq!(r.to_string(), "resource_1");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(Bytes);

impl ResourceId {
    /// Creates a resource ID from raw bytes.
    #[inline]
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Creates a resource ID from a textual name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(Bytes::copy_from_slice(name.as_bytes()))
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for ResourceId {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}
