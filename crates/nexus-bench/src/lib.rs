//! NexusDB Deadlock Detector Benchmarks
//!
//! This crate contains benchmarks for the detection pipeline:
//! - Wait-for graph maintenance
//! - Snapshotting
//! - Cycle scans over large graphs
//! - Full detection ticks
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p nexus-bench
//! ```

pub mod utils;
