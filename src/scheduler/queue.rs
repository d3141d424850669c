//! Due-time priority queue with lazy removal.
//!
//! Entries are ordered by due time, earliest first; entries with the same due
//! time come out in insertion order. Removing an arbitrary entry only marks
//! it dead: the slot stays in the heap until it reaches the top or the queue
//! is compacted, which happens once dead slots reach the compaction
//! threshold and make up at least half of the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use tracing::debug;

use crate::clock::Timestamp;

/// Identifies one queued entry. Later pushes get greater ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

struct Entry<T> {
    due: Timestamp,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the earliest due time, then the
        // earliest insertion.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-queue of items keyed by due time.
pub struct TaskQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    live: HashSet<u64>,
    next_seq: u64,
    dead: usize,
    compaction_threshold: usize,
}

impl<T> TaskQueue<T> {
    /// Create an empty queue that compacts once `compaction_threshold` dead
    /// slots have accumulated.
    pub fn new(compaction_threshold: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            next_seq: 0,
            dead: 0,
            compaction_threshold,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Returns `true` if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of heap slots, counting removed entries not yet reclaimed.
    pub fn slot_count(&self) -> usize {
        self.heap.len()
    }

    /// Enqueue `item` to become due at `due`.
    pub fn push(&mut self, due: Timestamp, item: T) -> EntryId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq);
        self.heap.push(Entry { due, seq, item });
        EntryId(seq)
    }

    /// Remove the entry `id`. Returns `false` if it already fired or was
    /// already removed.
    pub fn remove(&mut self, id: EntryId) -> bool {
        if !self.live.remove(&id.0) {
            return false;
        }
        self.dead += 1;
        self.maybe_compact();
        true
    }

    /// Dequeue every live entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<(Timestamp, T)> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|top| top.due <= now) {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if self.live.remove(&entry.seq) {
                due.push((entry.due, entry.item));
            } else {
                self.dead = self.dead.saturating_sub(1);
            }
        }
        due
    }

    fn maybe_compact(&mut self) {
        if self.dead < self.compaction_threshold || self.dead * 2 < self.heap.len() {
            return;
        }
        let before = self.heap.len();
        let live = &self.live;
        self.heap.retain(|entry| live.contains(&entry.seq));
        self.dead = 0;
        debug!(
            reclaimed = before - self.heap.len(),
            remaining = self.heap.len(),
            "compacted task queue"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn pops_earliest_first() {
        let mut queue = TaskQueue::new(64);
        queue.push(at(100), "b");
        queue.push(at(50), "a");
        queue.push(at(150), "c");

        let due = queue.pop_due(at(100));
        assert_eq!(due, vec![(at(50), "a"), (at(100), "b")]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn stops_at_first_future_entry() {
        let mut queue = TaskQueue::new(64);
        queue.push(at(10), 1);
        queue.push(at(20), 2);
        assert!(queue.pop_due(at(9)).is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn equal_due_times_pop_in_insertion_order() {
        let mut queue = TaskQueue::new(64);
        for i in 0..5 {
            queue.push(at(30), i);
        }
        let items: Vec<_> = queue.pop_due(at(30)).into_iter().map(|(_, i)| i).collect();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn removed_entries_are_skipped() {
        let mut queue = TaskQueue::new(64);
        let a = queue.push(at(10), "a");
        queue.push(at(20), "b");

        assert!(queue.remove(a));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.slot_count(), 2, "removal is lazy");

        assert_eq!(queue.pop_due(at(20)), vec![(at(20), "b")]);
        assert_eq!(queue.slot_count(), 0);
    }

    #[test]
    fn removing_twice_or_after_firing_is_a_noop() {
        let mut queue = TaskQueue::new(64);
        let a = queue.push(at(10), "a");
        let b = queue.push(at(20), "b");

        assert!(queue.remove(a));
        assert!(!queue.remove(a));

        queue.pop_due(at(20));
        assert!(!queue.remove(b));
        assert!(queue.is_empty());
    }

    #[test]
    fn compacts_when_dead_slots_dominate() {
        let mut queue = TaskQueue::new(4);
        let ids: Vec<_> = (0..6).map(|i| queue.push(at(100 + i), i)).collect();

        for id in &ids[..3] {
            queue.remove(*id);
        }
        assert_eq!(queue.slot_count(), 6, "below threshold, still lazy");

        queue.remove(ids[3]);
        assert_eq!(queue.slot_count(), 2);
        assert_eq!(queue.len(), 2);

        let items: Vec<_> = queue.pop_due(at(200)).into_iter().map(|(_, i)| i).collect();
        assert_eq!(items, vec![4, 5]);
    }

    #[test]
    fn does_not_compact_while_live_entries_dominate() {
        let mut queue = TaskQueue::new(1);
        let first = queue.push(at(1), 0);
        for i in 1..10 {
            queue.push(at(1 + i), i);
        }
        queue.remove(first);
        assert_eq!(queue.slot_count(), 10);
    }
}
