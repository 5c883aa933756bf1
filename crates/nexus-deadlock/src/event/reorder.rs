//! Bounded out-of-order tolerance for the lock event feed.
//!
//! Lock managers guarantee timestamp order per transaction only. Events
//! from different workers can overtake each other, so the buffer holds them
//! back until they are `window` older than the newest timestamp observed
//! (either from the feed or from the detection clock), then releases them
//! in `(timestamp, arrival)` order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use nexus_common::types::Timestamp;

use super::LockEvent;

/// How the buffer treated an incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The event is held until the watermark passes it.
    Buffered,
    /// The event is older than something already released and is handed
    /// back so the caller can apply it directly.
    Late(LockEvent),
}

struct Pending {
    seq: u64,
    event: LockEvent,
}

impl Pending {
    fn key(&self) -> (Timestamp, u64) {
        (self.event.timestamp(), self.seq)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Holds back lock events until they can be applied in timestamp order.
pub struct ReorderBuffer {
    heap: BinaryHeap<Reverse<Pending>>,
    window: Duration,
    capacity: usize,
    next_seq: u64,
    max_seen: Timestamp,
    last_released: Timestamp,
}

impl ReorderBuffer {
    /// Creates a buffer tolerating `window` of disorder and holding at most
    /// `capacity` events.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            window,
            capacity: capacity.max(1),
            next_seq: 0,
            max_seen: Timestamp::ZERO,
            last_released: Timestamp::ZERO,
        }
    }

    /// Offers an event to the buffer.
    pub fn push(&mut self, event: LockEvent) -> Admission {
        if event.timestamp() < self.last_released {
            return Admission::Late(event);
        }

        self.max_seen = self.max_seen.max(event.timestamp());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Pending { seq, event }));
        Admission::Buffered
    }

    /// Releases every event that is at least `window` older than the
    /// watermark, plus the oldest events beyond capacity.
    ///
    /// `now` advances the watermark when the feed goes quiet.
    pub fn drain_ready(&mut self, now: Option<Timestamp>) -> Vec<LockEvent> {
        let watermark = now
            .map_or(self.max_seen, |now| now.max(self.max_seen))
            .sub(self.window);

        let mut ready = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            let over_capacity = self.heap.len() > self.capacity;
            if top.event.timestamp() > watermark && !over_capacity {
                break;
            }
            if let Some(Reverse(pending)) = self.heap.pop() {
                self.last_released = self.last_released.max(pending.event.timestamp());
                ready.push(pending.event);
            }
        }
        ready
    }

    /// Releases every buffered event regardless of the watermark.
    pub fn flush(&mut self) -> Vec<LockEvent> {
        let mut ready = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(pending)) = self.heap.pop() {
            self.last_released = self.last_released.max(pending.event.timestamp());
            ready.push(pending.event);
        }
        ready
    }

    /// Returns the number of buffered events.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns the newest event timestamp observed.
    pub fn max_seen(&self) -> Timestamp {
        self.max_seen
    }
}

impl std::fmt::Debug for ReorderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReorderBuffer")
            .field("buffered", &self.heap.len())
            .field("window", &self.window)
            .field("capacity", &self.capacity)
            .field("max_seen", &self.max_seen)
            .finish()
    }
}
