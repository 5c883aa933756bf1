//! System-wide constants for the deadlock detector.
//!
//! These are the defaults used when a configuration file leaves a field out.

// =============================================================================
// Decision Constants
// =============================================================================

/// Default wait-time threshold in seconds.
///
/// A blocked transaction that has waited at least this long is treated as
/// deadlocked even without a cycle or a classifier signal.
pub const DEFAULT_WAIT_THRESHOLD_SECS: f64 = 10.0;

/// Default de-duplication window in seconds.
///
/// Repeat detections of the same vertex set inside this window do not
/// produce a new deadlock record.
pub const DEFAULT_DEDUP_WINDOW_SECS: u64 = 300;

// =============================================================================
// Event Feed Constants
// =============================================================================

/// Default out-of-order tolerance of the lock event feed in milliseconds.
pub const DEFAULT_REORDER_WINDOW_MS: u64 = 250;

/// Default maximum number of events held back for reordering.
pub const DEFAULT_REORDER_CAPACITY: usize = 4096;

// =============================================================================
// Emission and Scheduling Constants
// =============================================================================

/// Default bound on a single record store call in milliseconds.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;

/// Default interval between detection ticks in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
