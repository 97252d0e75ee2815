/*
Time-queue for the memory system model.

Nothing in the model blocks the host thread.  Work that has to happen later (an arbitration
round, a delivery, a device response) is parked in an `EventQueue` keyed by the simulated cycle at
which it becomes due.  The owner of the queue drains it with `pop_due` whenever the global clock
advances, and reports `next_at` so the top-level loop can skip idle cycles.

Events due at the same cycle pop in the order they were scheduled, which keeps every run
deterministic regardless of how the heap breaks ties internally.
*/

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::hash::Hash;

pub type Cycle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    when: Cycle,
    seq: u64,
}

#[derive(Debug)]
struct Scheduled<E> {
    key: EventKey,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Min-heap of future events.  Identical `(cycle, event)` pairs are coalesced, so components can
/// request "wake me at cycle N" repeatedly without flooding the queue.
#[derive(Debug)]
pub struct EventQueue<E: Copy + Eq + Hash> {
    heap: BinaryHeap<Reverse<Scheduled<E>>>,
    pending: HashSet<(Cycle, E)>,
    next_seq: u64,
}

impl<E: Copy + Eq + Hash> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Copy + Eq + Hash> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Schedule `event` at `when`.  Returns false if the same event was already pending at that
    /// cycle.
    pub fn schedule(&mut self, when: Cycle, event: E) -> bool {
        if !self.pending.insert((when, event)) {
            return false;
        }
        let key = EventKey {
            when,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.heap.push(Reverse(Scheduled { key, event }));
        true
    }

    pub fn is_scheduled(&self, when: Cycle, event: E) -> bool {
        self.pending.contains(&(when, event))
    }

    // Cycle of the earliest pending event.
    pub fn next_at(&self) -> Option<Cycle> {
        self.heap.peek().map(|Reverse(s)| s.key.when)
    }

    /// Pop the earliest event if it is due at or before `now`.
    pub fn pop_due(&mut self, now: Cycle) -> Option<(Cycle, E)> {
        if self.next_at()? > now {
            return None;
        }
        let Reverse(scheduled) = self.heap.pop()?;
        self.pending.remove(&(scheduled.key.when, scheduled.event));
        Some((scheduled.key.when, scheduled.event))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }
}

pub fn ceil_div_u64(nom: u64, denom: u64) -> u64 {
    debug_assert!(denom > 0);
    (nom + denom - 1) / denom
}
