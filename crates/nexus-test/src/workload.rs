//! Lock event sequences for tests.

use std::time::Duration;

use nexus_common::types::{ResourceId, Timestamp, TxnId};
use nexus_deadlock::{LockEvent, LockEventKind};
use rand::rngs::StdRng;
use rand::Rng;

/// Returns the transaction ID for a small test number.
pub fn txn(n: u128) -> TxnId {
    TxnId::from_u128(n)
}

/// Returns the resource named `R{n}`.
pub fn resource(n: usize) -> ResourceId {
    ResourceId::from_name(&format!("R{}", n))
}

/// Builds an event sequence with evenly spaced timestamps.
#[derive(Debug, Clone)]
pub struct EventScript {
    next: Timestamp,
    step: Duration,
    events: Vec<LockEvent>,
}

impl EventScript {
    /// Starts a script at `start`, one millisecond per event.
    pub fn new(start: Timestamp) -> Self {
        Self::with_step(start, Duration::from_millis(1))
    }

    /// Starts a script with a custom spacing.
    pub fn with_step(start: Timestamp, step: Duration) -> Self {
        Self {
            next: start,
            step,
            events: Vec::new(),
        }
    }

    /// Appends an event of the given kind.
    pub fn push(&mut self, txn_id: TxnId, resource: ResourceId, kind: LockEventKind) -> &mut Self {
        self.events
            .push(LockEvent::new(txn_id, resource, kind, self.next));
        self.next = self.next.add(self.step);
        self
    }

    /// Appends a `Held` event.
    pub fn held(&mut self, txn_id: TxnId, resource: ResourceId) -> &mut Self {
        self.push(txn_id, resource, LockEventKind::Held)
    }

    /// Appends a `Requested` event.
    pub fn requested(&mut self, txn_id: TxnId, resource: ResourceId) -> &mut Self {
        self.push(txn_id, resource, LockEventKind::Requested)
    }

    /// Appends a `Released` event.
    pub fn released(&mut self, txn_id: TxnId, resource: ResourceId) -> &mut Self {
        self.push(txn_id, resource, LockEventKind::Released)
    }

    /// Returns the timestamp the next event would get.
    pub fn now(&self) -> Timestamp {
        self.next
    }

    /// Returns the events so far.
    pub fn events(&self) -> &[LockEvent] {
        &self.events
    }

    /// Consumes the script.
    pub fn build(self) -> Vec<LockEvent> {
        self.events
    }
}

/// Appends a ring deadlock: `txns[i]` holds its own resource, then requests
/// the next transaction's. Resource numbers start at `first_resource`.
pub fn deadlock_ring(script: &mut EventScript, txns: &[TxnId], first_resource: usize) {
    for (i, &t) in txns.iter().enumerate() {
        script.held(t, resource(first_resource + i));
    }
    for (i, &t) in txns.iter().enumerate() {
        let next = (i + 1) % txns.len();
        script.requested(t, resource(first_resource + next));
    }
}

/// Generates `count` random events over `txns` transactions and
/// `resources` resources, one millisecond apart.
pub fn random_workload(
    rng: &mut StdRng,
    start: Timestamp,
    txns: u128,
    resources: usize,
    count: usize,
) -> Vec<LockEvent> {
    let mut script = EventScript::new(start);
    for _ in 0..count {
        let t = txn(rng.gen_range(1..=txns));
        let r = resource(rng.gen_range(0..resources));
        let kind = match rng.gen_range(0..10) {
            0..=3 => LockEventKind::Held,
            4..=7 => LockEventKind::Requested,
            _ => LockEventKind::Released,
        };
        script.push(t, r, kind);
    }
    script.build()
}

/// Shuffles events so that none moves more than `max_shift - 1` positions
/// from where it started.
pub fn jitter_order(rng: &mut StdRng, events: &[LockEvent], max_shift: usize) -> Vec<LockEvent> {
    let mut keyed: Vec<(usize, usize, &LockEvent)> = events
        .iter()
        .enumerate()
        .map(|(i, e)| (i + rng.gen_range(0..max_shift.max(1)), i, e))
        .collect();
    keyed.sort_by_key(|&(key, i, _)| (key, i));
    keyed.into_iter().map(|(_, _, e)| e.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_script_timestamps() {
        let mut script = EventScript::new(Timestamp::from_secs(1));
        script.held(txn(1), resource(0)).requested(txn(2), resource(0));

        let events = script.build();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].timestamp().as_micros() - events[0].timestamp().as_micros(),
            1_000
        );
    }

    #[test]
    fn test_ring_shape() {
        let mut script = EventScript::new(Timestamp::from_secs(1));
        deadlock_ring(&mut script, &[txn(1), txn(2), txn(3)], 0);
        let events = script.build();

        assert_eq!(events.len(), 6);
        assert_eq!(events[5].txn_id(), txn(3));
        assert_eq!(events[5].resource(), &resource(0));
    }

    #[test]
    fn test_jitter_is_a_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let events = random_workload(&mut rng, Timestamp::from_secs(1), 4, 4, 100);
        let shuffled = jitter_order(&mut rng, &events, 5);

        let mut a: Vec<_> = events.iter().map(LockEvent::timestamp).collect();
        let mut b: Vec<_> = shuffled.iter().map(LockEvent::timestamp).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }
}
