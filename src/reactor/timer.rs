//! Timer heap for deadline management.
//!
//! A small min-heap of `(deadline, event)` pairs. Entries are stamped with
//! a generation so a re-armed or cancelled deadline leaves a stale entry
//! behind that the reactor skips on expiry.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    event: u64,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of event deadlines.
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_generation: 1,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Adds a deadline for an event, returning the generation stamp the
    /// caller must hold to validate expiry.
    pub(crate) fn insert(&mut self, event: u64, deadline: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(TimerEntry {
            deadline,
            event,
            generation,
        });
        generation
    }

    /// Returns the earliest deadline, if any.
    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops all `(event, generation)` pairs whose deadline is `<= now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<(u64, u64)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                expired.push((entry.event, entry.generation));
            }
        }
        expired
    }
}
