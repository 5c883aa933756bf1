//! Cycle detection over a wait-for graph snapshot.
//!
//! Depth-first search with three colors:
//!
//! - white: not yet reached
//! - gray: on the current path
//! - black: fully explored, no cycle through it
//!
//! A gray successor is a back edge and closes a cycle. The reported cycle
//! is the path suffix starting at that successor, so transactions explored
//! on the way there but not on the loop are never included.
//!
//! The traversal keeps an explicit stack of `(node, successor iterator)`
//! frames instead of recursing, so long wait chains cannot exhaust the
//! thread stack.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use nexus_common::types::TxnId;
use tracing::debug;

use crate::graph::GraphSnapshot;

/// A closed path in the wait-for graph.
///
/// `transactions[i]` waits for `transactions[i + 1]`, and the last waits
/// for the first. Each transaction appears exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    transactions: Vec<TxnId>,
}

impl Cycle {
    fn new(transactions: Vec<TxnId>) -> Self {
        Self { transactions }
    }

    /// Returns the transactions in wait order.
    pub fn transactions(&self) -> &[TxnId] {
        &self.transactions
    }

    /// Returns the cycle's vertex set.
    pub fn vertex_set(&self) -> BTreeSet<TxnId> {
        self.transactions.iter().copied().collect()
    }

    /// Returns the edges of the cycle, including the wraparound edge.
    pub fn edges(&self) -> impl Iterator<Item = (TxnId, TxnId)> + '_ {
        let n = self.transactions.len();
        (0..n).map(move |i| (self.transactions[i], self.transactions[(i + 1) % n]))
    }

    /// Returns true if the transaction is part of the cycle.
    pub fn contains(&self, txn_id: &TxnId) -> bool {
        self.transactions.contains(txn_id)
    }

    /// Returns the number of transactions in the cycle.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Always false; a cycle has at least two transactions.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Consumes the cycle, returning the transactions in wait order.
    pub fn into_transactions(self) -> Vec<TxnId> {
        self.transactions
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for txn in &self.transactions {
            write!(f, "{} -> ", txn)?;
        }
        match self.transactions.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

/// Cycle detector statistics.
#[derive(Debug, Default)]
pub struct DetectorStats {
    /// Number of scans performed.
    pub scans: AtomicU64,
    /// Number of scans that found a cycle.
    pub cycles_found: AtomicU64,
    /// Nodes entered across all scans.
    pub nodes_visited: AtomicU64,
}

impl DetectorStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// Finds cycles in wait-for graph snapshots.
#[derive(Debug, Default)]
pub struct CycleDetector {
    stats: DetectorStats,
}

impl CycleDetector {
    /// Creates a new cycle detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cycle if the graph has one.
    ///
    /// Every node with an outgoing edge is tried as a root, so every weakly
    /// connected component is examined. O(V + E).
    pub fn find_cycle(&self, snapshot: &GraphSnapshot) -> Option<Cycle> {
        self.find_cycle_excluding(snapshot, &BTreeSet::new())
    }

    /// Returns a cycle that avoids every transaction in `excluded`.
    ///
    /// Excluded transactions are treated as absent from the graph. The
    /// engine passes the transactions of deadlocks it already recorded so a
    /// second, unrelated deadlock is still found.
    pub fn find_cycle_excluding(
        &self,
        snapshot: &GraphSnapshot,
        excluded: &BTreeSet<TxnId>,
    ) -> Option<Cycle> {
        self.stats.scans.fetch_add(1, AtomicOrdering::Relaxed);

        let mut colors: HashMap<TxnId, Color> = HashMap::new();
        let mut visited = 0u64;
        let mut found = None;

        'roots: for &root in snapshot.waiters() {
            if excluded.contains(&root) || colors.contains_key(&root) {
                continue;
            }

            colors.insert(root, Color::Gray);
            visited += 1;
            let mut stack = vec![(root, snapshot.successors(&root))];

            loop {
                let (node, next) = match stack.last_mut() {
                    Some((node, successors)) => (*node, successors.next().copied()),
                    None => break,
                };

                let Some(next) = next else {
                    colors.insert(node, Color::Black);
                    stack.pop();
                    continue;
                };
                if excluded.contains(&next) {
                    continue;
                }

                match colors.get(&next) {
                    None => {
                        colors.insert(next, Color::Gray);
                        visited += 1;
                        stack.push((next, snapshot.successors(&next)));
                    }
                    Some(Color::Gray) => {
                        // Back edge: the cycle is the path from `next` to `node`.
                        if let Some(start) = stack.iter().position(|(txn, _)| *txn == next) {
                            let path = stack[start..].iter().map(|(txn, _)| *txn).collect();
                            found = Some(Cycle::new(path));
                            break 'roots;
                        }
                    }
                    Some(Color::Black) => {}
                }
            }
        }

        self.stats
            .nodes_visited
            .fetch_add(visited, AtomicOrdering::Relaxed);
        if let Some(cycle) = &found {
            self.stats.cycles_found.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(len = cycle.len(), visited, "found wait-for cycle");
        }
        found
    }

    /// Returns true if the graph contains any cycle.
    pub fn has_cycle(&self, snapshot: &GraphSnapshot) -> bool {
        self.find_cycle(snapshot).is_some()
    }

    /// Returns statistics.
    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }
}
