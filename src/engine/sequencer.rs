//! Sequence assignment and receive-side reordering.
//!
//! The send side stamps every accepted event from an atomic counter. On the
//! receive side, [`Resequencer`] restores monotonic order inside a bounded
//! window: early arrivals wait in a min-heap until the gap before them
//! fills, and when the window overflows delivery skips to the earliest
//! buffered event, reporting the gap instead of stalling forever.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use tracing::warn;

use crate::core::error::SequenceError;
use crate::core::event::SequencedEvent;

/// Monotonic sequence-number source for the send side.
#[derive(Debug, Default)]
pub struct SequenceAssigner {
    counter: std::sync::atomic::AtomicU64,
}

impl SequenceAssigner {
    /// Create an assigner starting at 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next sequence number; the first call returns 1.
    pub fn next(&self) -> u64 {
        self.counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1
    }

    /// The most recently assigned number, 0 when none was assigned yet.
    pub fn last_assigned(&self) -> u64 {
        self.counter.load(std::sync::atomic::Ordering::Relaxed)
    }
}

struct Pending<E> {
    seq: u64,
    event: SequencedEvent<E>,
}

impl<E> PartialEq for Pending<E> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl<E> Eq for Pending<E> {}
impl<E> PartialOrd for Pending<E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<E> Ord for Pending<E> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

/// Bounded reorder window for the receive side.
pub struct Resequencer<E> {
    next_expected: u64,
    heap: BinaryHeap<Reverse<Pending<E>>>,
    buffered: HashSet<u64>,
    capacity: usize,
}

impl<E> Resequencer<E> {
    /// Create a window holding at most `capacity` out-of-order events.
    pub fn new(capacity: usize) -> Self {
        Self {
            next_expected: 1,
            heap: BinaryHeap::with_capacity(capacity),
            buffered: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of events waiting in the window.
    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    /// The sequence number delivery is currently waiting for.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Offer one arrival; returns the events now deliverable in order plus
    /// any protocol errors the arrival exposed.
    pub fn offer(
        &mut self,
        event: SequencedEvent<E>,
    ) -> (Vec<SequencedEvent<E>>, Vec<SequenceError>) {
        let seq = event.sequence_num;
        let mut delivered = Vec::new();
        let mut errors = Vec::new();

        if seq < self.next_expected || self.buffered.contains(&seq) {
            errors.push(SequenceError::DuplicateSequence { sequence: seq });
            return (delivered, errors);
        }

        if seq == self.next_expected {
            self.next_expected += 1;
            delivered.push(event);
            self.drain_contiguous(&mut delivered);
            return (delivered, errors);
        }

        self.buffered.insert(seq);
        self.heap.push(Reverse(Pending { seq, event }));

        // A full window with an unfilled gap cannot make progress; skip to
        // the earliest buffered event and report what was lost.
        while self.heap.len() >= self.capacity {
            let Some(Reverse(smallest)) = self.heap.peek() else {
                break;
            };
            let smallest_seq = smallest.seq;
            if smallest_seq <= self.next_expected {
                break;
            }
            warn!(
                missing_from = self.next_expected,
                missing_to = smallest_seq - 1,
                "reorder window full, skipping sequence gap"
            );
            errors.push(SequenceError::SequenceGap {
                missing_from: self.next_expected,
                missing_to: smallest_seq - 1,
            });
            self.next_expected = smallest_seq;
            self.drain_contiguous(&mut delivered);
        }

        (delivered, errors)
    }

    /// Drain everything still buffered, in order, reporting the gaps between
    /// non-contiguous runs. Called when the stream ends.
    pub fn flush(&mut self) -> (Vec<SequencedEvent<E>>, Vec<SequenceError>) {
        let mut delivered = Vec::new();
        let mut errors = Vec::new();
        while let Some(Reverse(pending)) = self.heap.pop() {
            self.buffered.remove(&pending.seq);
            if pending.seq > self.next_expected {
                errors.push(SequenceError::SequenceGap {
                    missing_from: self.next_expected,
                    missing_to: pending.seq - 1,
                });
            }
            self.next_expected = pending.seq + 1;
            delivered.push(pending.event);
        }
        (delivered, errors)
    }

    fn drain_contiguous(&mut self, delivered: &mut Vec<SequencedEvent<E>>) {
        while let Some(Reverse(pending)) = self.heap.peek() {
            if pending.seq != self.next_expected {
                break;
            }
            let Some(Reverse(pending)) = self.heap.pop() else {
                break;
            };
            self.buffered.remove(&pending.seq);
            self.next_expected += 1;
            delivered.push(pending.event);
        }
    }
}
