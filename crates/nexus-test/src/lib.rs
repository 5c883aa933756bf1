//! # nexus-test
//!
//! Integration tests for the NexusDB deadlock detector.
//!
//! This crate contains:
//! - Workload generators producing lock event sequences
//! - Reference implementations the detector is checked against
//! - Cross-crate tests under `tests/`

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Workload generators
pub mod workload;

/// Brute-force reference checks
pub mod reference;
