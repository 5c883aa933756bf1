//! Wait-for graph maintained from lock events.
//!
//! The graph tracks which transactions are waiting for which:
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T3:  T2 -> T3
//! T3 waits for T1:  T3 -> T1 (cycle = deadlock!)
//! ```
//!
//! An edge `A -> B` exists iff A has an outstanding `Requested` event for
//! some resource R, B has a `Held` event for R, and A != B. The graph is a
//! pure projection of the open lock events: [`WaitForGraph::rebuild`]
//! recomputes it from scratch and yields the same snapshot.
//!
//! Each edge carries a count of the resources that justify it, so releasing
//! one resource only removes edges that no other resource still supports.
//!
//! # Concurrency
//!
//! Mutation happens under a write lock and never suspends. Readers take a
//! [`GraphSnapshot`] (a copy made under the read lock) and traverse that,
//! so a scan never blocks event ingestion and never sees a half-applied
//! event.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use nexus_common::types::{ResourceId, Timestamp, TxnId};
use parking_lot::RwLock;
use tracing::debug;

use crate::event::{LockEvent, LockEventKind};

/// Statistics about graph maintenance.
#[derive(Debug, Default)]
pub struct GraphStats {
    /// Events that changed the graph state.
    pub events_applied: AtomicU64,
    /// Events that were duplicates or otherwise had no effect.
    pub noop_events: AtomicU64,
    /// Edges that appeared.
    pub edges_added: AtomicU64,
    /// Edges that disappeared.
    pub edges_removed: AtomicU64,
}

impl GraphStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Edge bookkeeping: waiter -> holder -> number of resources behind the edge.
type EdgeCounts = HashMap<TxnId, HashMap<TxnId, usize>>;

/// Mutable state behind the lock.
#[derive(Debug, Default)]
struct GraphState {
    /// Current holders of each resource.
    holders: HashMap<ResourceId, HashSet<TxnId>>,
    /// Transactions with an outstanding request on each resource.
    waiters: HashMap<ResourceId, HashSet<TxnId>>,
    /// Outstanding requests per transaction, with the request time.
    waiting_on: HashMap<TxnId, HashMap<ResourceId, Timestamp>>,
    /// Wait-for edges.
    edges: EdgeCounts,
    /// Bumped on every state change.
    version: u64,
}

/// Edge delta produced by applying one event.
#[derive(Debug, Default, Clone, Copy)]
struct Delta {
    changed: bool,
    added: u64,
    removed: u64,
}

fn add_edge(edges: &mut EdgeCounts, waiter: TxnId, holder: TxnId, delta: &mut Delta) {
    if waiter == holder {
        return;
    }
    let count = edges.entry(waiter).or_default().entry(holder).or_insert(0);
    if *count == 0 {
        delta.added += 1;
    }
    *count += 1;
}

fn remove_edge(edges: &mut EdgeCounts, waiter: TxnId, holder: TxnId, delta: &mut Delta) {
    let Some(holders) = edges.get_mut(&waiter) else {
        return;
    };
    if let Some(count) = holders.get_mut(&holder) {
        *count -= 1;
        if *count == 0 {
            holders.remove(&holder);
            delta.removed += 1;
        }
    }
    if holders.is_empty() {
        edges.remove(&waiter);
    }
}

impl GraphState {
    fn apply(&mut self, event: &LockEvent) -> Delta {
        let txn = event.txn_id();
        let resource = event.resource();

        let delta = match event.kind() {
            LockEventKind::Held => self.apply_held(txn, resource),
            LockEventKind::Requested => self.apply_requested(txn, resource, event.timestamp()),
            LockEventKind::Released => self.apply_released(txn, resource),
        };

        if delta.changed {
            self.version += 1;
        }
        delta
    }

    fn holds(&self, txn: TxnId, resource: &ResourceId) -> bool {
        self.holders
            .get(resource)
            .is_some_and(|holders| holders.contains(&txn))
    }

    fn is_requesting(&self, txn: TxnId, resource: &ResourceId) -> bool {
        self.waiting_on
            .get(&txn)
            .is_some_and(|requests| requests.contains_key(resource))
    }

    fn apply_held(&mut self, txn: TxnId, resource: &ResourceId) -> Delta {
        let mut delta = Delta::default();
        if self.holds(txn, resource) {
            return delta;
        }
        delta.changed = true;

        // A grant closes the transaction's own wait on this resource.
        self.cancel_request(txn, resource, &mut delta);

        self.holders.entry(resource.clone()).or_default().insert(txn);
        if let Some(waiters) = self.waiters.get(resource) {
            for &waiter in waiters {
                add_edge(&mut self.edges, waiter, txn, &mut delta);
            }
        }
        delta
    }

    fn apply_requested(&mut self, txn: TxnId, resource: &ResourceId, at: Timestamp) -> Delta {
        let mut delta = Delta::default();
        if self.holds(txn, resource) || self.is_requesting(txn, resource) {
            return delta;
        }
        delta.changed = true;

        self.waiters.entry(resource.clone()).or_default().insert(txn);
        self.waiting_on
            .entry(txn)
            .or_default()
            .insert(resource.clone(), at);
        if let Some(holders) = self.holders.get(resource) {
            for &holder in holders {
                add_edge(&mut self.edges, txn, holder, &mut delta);
            }
        }
        delta
    }

    fn apply_released(&mut self, txn: TxnId, resource: &ResourceId) -> Delta {
        let mut delta = Delta::default();

        let was_holder = self
            .holders
            .get_mut(resource)
            .is_some_and(|holders| holders.remove(&txn));
        if was_holder {
            delta.changed = true;
            if self.holders.get(resource).is_some_and(HashSet::is_empty) {
                self.holders.remove(resource);
            }
            if let Some(waiters) = self.waiters.get(resource) {
                for &waiter in waiters {
                    remove_edge(&mut self.edges, waiter, txn, &mut delta);
                }
            }
        }

        self.cancel_request(txn, resource, &mut delta);
        delta
    }

    /// Drops an outstanding request and the edges it produced.
    fn cancel_request(&mut self, txn: TxnId, resource: &ResourceId, delta: &mut Delta) {
        let removed = match self.waiting_on.get_mut(&txn) {
            Some(requests) => {
                let removed = requests.remove(resource).is_some();
                if requests.is_empty() {
                    self.waiting_on.remove(&txn);
                }
                removed
            }
            None => false,
        };
        if !removed {
            return;
        }
        delta.changed = true;

        if let Some(waiters) = self.waiters.get_mut(resource) {
            waiters.remove(&txn);
            if waiters.is_empty() {
                self.waiters.remove(resource);
            }
        }
        if let Some(holders) = self.holders.get(resource) {
            for &holder in holders {
                remove_edge(&mut self.edges, txn, holder, delta);
            }
        }
    }

    fn snapshot(&self) -> GraphSnapshot {
        let edges: BTreeMap<TxnId, BTreeSet<TxnId>> = self
            .edges
            .iter()
            .map(|(&waiter, holders)| (waiter, holders.keys().copied().collect()))
            .collect();

        // Only blocked transactions (those with an outgoing edge) wait.
        let waiting_since = edges
            .keys()
            .filter_map(|waiter| {
                self.waiting_on
                    .get(waiter)
                    .and_then(|requests| requests.values().min().copied())
                    .map(|since| (*waiter, since))
            })
            .collect();

        GraphSnapshot {
            edges,
            waiting_since,
            version: self.version,
        }
    }
}

/// An immutable copy of the wait-for graph.
///
/// Iteration order is deterministic (sorted by transaction ID), so two
/// snapshots of the same state traverse identically. Equality ignores the
/// version counter.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
    waiting_since: BTreeMap<TxnId, Timestamp>,
    version: u64,
}

impl GraphSnapshot {
    /// Builds a snapshot directly from an edge list, skipping self-edges.
    pub fn from_edges(edges: impl IntoIterator<Item = (TxnId, TxnId)>) -> Self {
        let mut map: BTreeMap<TxnId, BTreeSet<TxnId>> = BTreeMap::new();
        for (waiter, holder) in edges {
            if waiter != holder {
                map.entry(waiter).or_default().insert(holder);
            }
        }
        Self {
            edges: map,
            waiting_since: BTreeMap::new(),
            version: 0,
        }
    }

    /// Returns the transactions `txn` is waiting for.
    pub fn successors(&self, txn: &TxnId) -> impl Iterator<Item = &TxnId> + '_ {
        self.edges.get(txn).into_iter().flatten()
    }

    /// Returns the transactions with at least one outgoing edge.
    pub fn waiters(&self) -> impl Iterator<Item = &TxnId> + '_ {
        self.edges.keys()
    }

    /// Returns every transaction that appears on either end of an edge.
    pub fn nodes(&self) -> BTreeSet<TxnId> {
        self.edges
            .iter()
            .flat_map(|(waiter, holders)| std::iter::once(waiter).chain(holders.iter()))
            .copied()
            .collect()
    }

    /// Returns true if `waiter -> holder` is an edge.
    pub fn has_edge(&self, waiter: &TxnId, holder: &TxnId) -> bool {
        self.edges
            .get(waiter)
            .is_some_and(|holders| holders.contains(holder))
    }

    /// Returns all edges in deterministic order.
    pub fn edges(&self) -> impl Iterator<Item = (TxnId, TxnId)> + '_ {
        self.edges
            .iter()
            .flat_map(|(&waiter, holders)| holders.iter().map(move |&holder| (waiter, holder)))
    }

    /// Returns the number of transactions in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    /// Returns the number of wait edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Returns true if the graph has no edges.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Returns when each blocked transaction started waiting (its oldest
    /// outstanding request).
    pub fn waiting_since(&self) -> &BTreeMap<TxnId, Timestamp> {
        &self.waiting_since
    }

    /// Returns the graph version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl PartialEq for GraphSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.edges == other.edges && self.waiting_since == other.waiting_since
    }
}

impl Eq for GraphSnapshot {}

/// The wait-for graph for deadlock detection.
pub struct WaitForGraph {
    state: RwLock<GraphState>,
    stats: GraphStats,
}

impl WaitForGraph {
    /// Creates a new empty wait-for graph.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            stats: GraphStats::new(),
        }
    }

    /// Builds a graph from an event sequence.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a LockEvent>) -> Self {
        let graph = Self::new();
        for event in events {
            graph.apply(event);
        }
        graph
    }

    /// Applies one lock event. Returns true if the graph state changed.
    ///
    /// Duplicate `Held`/`Requested` events and releases of unknown locks
    /// are no-ops.
    pub fn apply(&self, event: &LockEvent) -> bool {
        let delta = self.state.write().apply(event);
        self.record(event, delta);
        delta.changed
    }

    /// Discards all state and replays `events`.
    pub fn rebuild<'a>(&self, events: impl IntoIterator<Item = &'a LockEvent>) {
        let mut fresh = GraphState::default();
        let mut applied = 0u64;
        for event in events {
            if fresh.apply(event).changed {
                applied += 1;
            }
        }

        let mut state = self.state.write();
        fresh.version = state.version + 1;
        *state = fresh;
        drop(state);

        debug!(applied, "rebuilt wait-for graph");
    }

    /// Takes an immutable copy of the current graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.state.read().snapshot()
    }

    /// Returns the current holders of a resource.
    pub fn holders_of(&self, resource: &ResourceId) -> Vec<TxnId> {
        self.state
            .read()
            .holders
            .get(resource)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns what a transaction is waiting for.
    pub fn get_waits(&self, waiter: TxnId) -> Vec<TxnId> {
        self.state
            .read()
            .edges
            .get(&waiter)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Checks if a transaction is blocked on another transaction.
    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.state.read().edges.contains_key(&txn_id)
    }

    /// Returns the number of wait edges.
    pub fn edge_count(&self) -> usize {
        self.state.read().edges.values().map(HashMap::len).sum()
    }

    /// Returns the number of resources with at least one holder.
    pub fn held_resource_count(&self) -> usize {
        self.state.read().holders.len()
    }

    /// Returns the current graph version.
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Returns statistics.
    pub fn stats(&self) -> &GraphStats {
        &self.stats
    }

    fn record(&self, event: &LockEvent, delta: Delta) {
        if !delta.changed {
            self.stats.noop_events.fetch_add(1, AtomicOrdering::Relaxed);
            return;
        }
        self.stats.events_applied.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats
            .edges_added
            .fetch_add(delta.added, AtomicOrdering::Relaxed);
        self.stats
            .edges_removed
            .fetch_add(delta.removed, AtomicOrdering::Relaxed);
        debug!(
            txn = %event.txn_id(),
            resource = %event.resource(),
            kind = %event.kind(),
            added = delta.added,
            removed = delta.removed,
            "applied lock event"
        );
    }
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitForGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForGraph")
            .field("edge_count", &self.edge_count())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u128) -> TxnId {
        TxnId::from_u128(id)
    }

    fn ts(micros: u64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    #[test]
    fn test_single_held_has_no_edges() {
        let graph = WaitForGraph::new();
        assert!(graph.apply(&LockEvent::held(t(1), "R1", ts(1))));
        assert!(graph.snapshot().is_empty());
        assert_eq!(graph.holders_of(&ResourceId::from_name("R1")), vec![t(1)]);
    }

    #[test]
    fn test_two_way_wait() {
        let graph = WaitForGraph::from_events(&[
            LockEvent::held(t(1), "R1", ts(1)),
            LockEvent::held(t(2), "R2", ts(2)),
            LockEvent::requested(t(1), "R2", ts(3)),
            LockEvent::requested(t(2), "R1", ts(4)),
        ]);

        let snapshot = graph.snapshot();
        assert!(snapshot.has_edge(&t(1), &t(2)));
        assert!(snapshot.has_edge(&t(2), &t(1)));
        assert_eq!(snapshot.edge_count(), 2);
        assert_eq!(snapshot.node_count(), 2);
        assert_eq!(snapshot.waiting_since().get(&t(1)), Some(&ts(3)));
        assert_eq!(snapshot.waiting_since().get(&t(2)), Some(&ts(4)));
    }

    #[test]
    fn test_request_before_hold_materializes_edge() {
        let graph = WaitForGraph::new();
        graph.apply(&LockEvent::requested(t(1), "R1", ts(1)));
        assert!(!graph.is_waiting(t(1)));

        graph.apply(&LockEvent::held(t(2), "R1", ts(2)));
        assert_eq!(graph.get_waits(t(1)), vec![t(2)]);
    }

    #[test]
    fn test_no_self_edges() {
        let graph = WaitForGraph::new();
        graph.apply(&LockEvent::held(t(1), "R1", ts(1)));
        // Re-requesting an already held resource is a no-op.
        assert!(!graph.apply(&LockEvent::requested(t(1), "R1", ts(2))));

        // Requesting then being granted a shared resource never links T1 to itself.
        graph.apply(&LockEvent::requested(t(1), "R2", ts(3)));
        graph.apply(&LockEvent::held(t(2), "R2", ts(4)));
        graph.apply(&LockEvent::held(t(1), "R2", ts(5)));

        let snapshot = graph.snapshot();
        for (waiter, holder) in snapshot.edges() {
            assert_ne!(waiter, holder);
        }
        assert!(!snapshot.has_edge(&t(1), &t(1)));
        assert!(!graph.is_waiting(t(1)));
    }

    #[test]
    fn test_duplicate_delivery_is_noop() {
        let graph = WaitForGraph::new();
        assert!(graph.apply(&LockEvent::held(t(1), "R1", ts(1))));
        assert!(!graph.apply(&LockEvent::held(t(1), "R1", ts(1))));
        assert!(graph.apply(&LockEvent::requested(t(2), "R1", ts(2))));
        assert!(!graph.apply(&LockEvent::requested(t(2), "R1", ts(3))));
        assert!(!graph.apply(&LockEvent::released(t(3), "R1", ts(4))));

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.stats().noop_events.load(AtomicOrdering::Relaxed), 3);
        assert_eq!(graph.stats().edges_added.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_release_clears_edges() {
        let graph = WaitForGraph::from_events(&[
            LockEvent::held(t(2), "R", ts(1)),
            LockEvent::requested(t(1), "R", ts(2)),
            LockEvent::requested(t(3), "R", ts(3)),
        ]);
        assert_eq!(graph.edge_count(), 2);

        graph.apply(&LockEvent::released(t(2), "R", ts(4)));
        let snapshot = graph.snapshot();
        assert!(!snapshot.has_edge(&t(1), &t(2)));
        assert!(!snapshot.has_edge(&t(3), &t(2)));
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_release_keeps_edges_backed_by_other_resources() {
        let graph = WaitForGraph::from_events(&[
            LockEvent::held(t(2), "R1", ts(1)),
            LockEvent::held(t(2), "R2", ts(2)),
            LockEvent::requested(t(1), "R1", ts(3)),
            LockEvent::requested(t(1), "R2", ts(4)),
        ]);
        assert_eq!(graph.edge_count(), 1);

        graph.apply(&LockEvent::released(t(2), "R1", ts(5)));
        assert!(graph.snapshot().has_edge(&t(1), &t(2)));

        graph.apply(&LockEvent::released(t(2), "R2", ts(6)));
        assert!(graph.snapshot().is_empty());
    }

    #[test]
    fn test_released_request_cancels_wait() {
        let graph = WaitForGraph::from_events(&[
            LockEvent::held(t(2), "R", ts(1)),
            LockEvent::requested(t(1), "R", ts(2)),
        ]);
        graph.apply(&LockEvent::released(t(1), "R", ts(3)));
        assert!(graph.snapshot().is_empty());

        // Releasing again is a no-op.
        assert!(!graph.apply(&LockEvent::released(t(1), "R", ts(4))));
    }

    #[test]
    fn test_grant_closes_wait() {
        let graph = WaitForGraph::from_events(&[
            LockEvent::held(t(2), "R", ts(1)),
            LockEvent::requested(t(1), "R", ts(2)),
            LockEvent::released(t(2), "R", ts(3)),
            LockEvent::held(t(1), "R", ts(4)),
            LockEvent::requested(t(3), "R", ts(5)),
        ]);

        let snapshot = graph.snapshot();
        assert!(!graph.is_waiting(t(1)));
        assert!(snapshot.has_edge(&t(3), &t(1)));
        assert_eq!(snapshot.edge_count(), 1);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let events = vec![
            LockEvent::held(t(1), "R1", ts(1)),
            LockEvent::held(t(2), "R2", ts(2)),
            LockEvent::requested(t(1), "R2", ts(3)),
            LockEvent::requested(t(2), "R1", ts(4)),
            LockEvent::requested(t(3), "R1", ts(5)),
            LockEvent::released(t(3), "R1", ts(6)),
        ];

        let first = WaitForGraph::from_events(&events).snapshot();
        let second = WaitForGraph::from_events(&events).snapshot();
        assert_eq!(first, second);

        let graph = WaitForGraph::new();
        graph.apply(&LockEvent::held(t(9), "R9", ts(1)));
        graph.apply(&LockEvent::requested(t(8), "R9", ts(1)));
        graph.rebuild(&events);
        assert_eq!(graph.snapshot(), first);
        assert!(graph.version() > 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let graph = WaitForGraph::from_events(&[
            LockEvent::held(t(2), "R", ts(1)),
            LockEvent::requested(t(1), "R", ts(2)),
        ]);
        let before = graph.snapshot();
        graph.apply(&LockEvent::released(t(2), "R", ts(3)));

        assert!(before.has_edge(&t(1), &t(2)));
        assert!(graph.snapshot().is_empty());
        assert!(graph.snapshot().version() > before.version());
    }

    #[test]
    fn test_snapshot_from_edges_skips_self_loops() {
        let snapshot = GraphSnapshot::from_edges([(t(1), t(1)), (t(1), t(2))]);
        assert_eq!(snapshot.edge_count(), 1);
        assert_eq!(snapshot.successors(&t(1)).copied().collect::<Vec<_>>(), vec![t(2)]);
        assert_eq!(snapshot.successors(&t(2)).count(), 0);
    }
}
