//! Benchmark utilities and helpers.

use nexus_common::types::{ResourceId, Timestamp, TxnId};
use nexus_deadlock::{LockEvent, LockEventKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn resource(n: usize) -> ResourceId {
    ResourceId::from_name(&format!("res_{:08}", n))
}

fn at(i: usize) -> Timestamp {
    Timestamp::from_micros(1_000_000 + i as u64)
}

/// Generates a chain `T0 -> T1 -> ... -> Tn-1`: each transaction holds its
/// own resource and requests the next one's. Closing the chain makes a
/// single ring deadlock.
pub fn generate_chain(len: usize, closed: bool) -> Vec<LockEvent> {
    let txn = |i: usize| TxnId::from_u128(i as u128 + 1);
    let mut events = Vec::with_capacity(len * 2);

    for i in 0..len {
        events.push(LockEvent::held(txn(i), resource(i), at(events.len())));
    }
    let waiters = if closed { len } else { len.saturating_sub(1) };
    for i in 0..waiters {
        let next = (i + 1) % len;
        events.push(LockEvent::requested(txn(i), resource(next), at(events.len())));
    }
    events
}

/// Generates a random lock workload.
pub fn generate_workload(count: usize, txns: u128, resources: usize) -> Vec<LockEvent> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|i| {
            let txn = TxnId::from_u128(rng.gen_range(1..=txns));
            let kind = match rng.gen_range(0..10) {
                0..=3 => LockEventKind::Held,
                4..=7 => LockEventKind::Requested,
                _ => LockEventKind::Released,
            };
            LockEvent::new(txn, resource(rng.gen_range(0..resources)), kind, at(i))
        })
        .collect()
}

/// Generates `count` disjoint two-transaction deadlocks.
pub fn generate_pair_deadlocks(count: usize) -> Vec<LockEvent> {
    let mut events = Vec::with_capacity(count * 4);
    for pair in 0..count {
        let a = TxnId::from_u128(2 * pair as u128 + 1);
        let b = TxnId::from_u128(2 * pair as u128 + 2);
        let (ra, rb) = (resource(2 * pair), resource(2 * pair + 1));
        events.push(LockEvent::held(a, ra.clone(), at(events.len())));
        events.push(LockEvent::held(b, rb.clone(), at(events.len())));
        events.push(LockEvent::requested(a, rb, at(events.len())));
        events.push(LockEvent::requested(b, ra, at(events.len())));
    }
    events
}
