//! # nexus-common
//!
//! Common types and constants for the NexusDB deadlock detector.
//!
//! This crate provides the foundational types shared by the detection
//! engine, the daemon and the test crates:
//!
//! - **Types**: Identifiers (`TxnId`, `ResourceId`, `DeadlockId`) and
//!   the microsecond `Timestamp`
//! - **Constants**: Configuration defaults
//!
//! ## Example
//!
//! ```rust
//! use nexus_common::types::{ResourceId, Timestamp, TxnId};
//!
//! let txn = TxnId::generate();
//! let resource = ResourceId::from_name("orders:42");
//! let at = Timestamp::now();
//! assert!(txn.is_valid() && !resource.is_empty() && at > Timestamp::ZERO);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use types::{DeadlockId, ResourceId, Timestamp, TxnId};
