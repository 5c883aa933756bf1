//! Slow, obviously-correct versions of what the detector computes.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use nexus_common::types::{ResourceId, TxnId};
use nexus_deadlock::{GraphSnapshot, LockEvent, LockEventKind};

/// Replays events into plain holder/request sets and derives the wait-for
/// edges from scratch.
pub fn expected_edges(events: &[LockEvent]) -> BTreeSet<(TxnId, TxnId)> {
    let mut holders: HashSet<(TxnId, ResourceId)> = HashSet::new();
    let mut requests: HashSet<(TxnId, ResourceId)> = HashSet::new();

    for event in events {
        let key = (event.txn_id(), event.resource().clone());
        match event.kind() {
            LockEventKind::Held => {
                if !holders.contains(&key) {
                    requests.remove(&key);
                    holders.insert(key);
                }
            }
            LockEventKind::Requested => {
                if !holders.contains(&key) {
                    requests.insert(key);
                }
            }
            LockEventKind::Released => {
                holders.remove(&key);
                requests.remove(&key);
            }
        }
    }

    let mut edges = BTreeSet::new();
    for (waiter, wanted) in &requests {
        for (holder, held) in &holders {
            if wanted == held && waiter != holder {
                edges.insert((*waiter, *holder));
            }
        }
    }
    edges
}

/// Kahn's algorithm: true if every node can be removed in topological
/// order.
pub fn is_acyclic(snapshot: &GraphSnapshot) -> bool {
    let nodes = snapshot.nodes();
    let mut in_degree: HashMap<TxnId, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    for (_, to) in snapshot.edges() {
        *in_degree.entry(to).or_insert(0) += 1;
    }

    let mut ready: VecDeque<TxnId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut removed = 0;
    while let Some(node) = ready.pop_front() {
        removed += 1;
        for next in snapshot.successors(&node) {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.push_back(*next);
                }
            }
        }
    }
    removed == nodes.len()
}
