//! Type definitions shared by the deadlock detector crates.

mod ids;
mod timestamps;

pub use ids::{DeadlockId, ResourceId, TxnId};
pub use timestamps::Timestamp;
