//! Indexed priority queue with de-duplication and bounded eviction.
//!
//! Entries are ordered by `(priority, insertion)`: the highest priority is
//! popped first and, among equal priorities, the oldest insertion wins. The
//! eviction end is the mirror image: the lowest priority goes first and,
//! among equal priorities, the oldest insertion is evicted.
//!
//! A `BTreeMap` keyed by the ordering tuple serves as the heap so both ends
//! are reachable in O(log n); a `HashMap` from item identity to its ordering
//! key gives O(log n) upsert and removal.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use chrono::{DateTime, Utc};

/// A totally ordered priority value.
///
/// NaN is normalized to zero on construction so every value has a place in
/// the ordering.
#[derive(Debug, Clone, Copy)]
pub struct Priority(f64);

impl Priority {
    /// Create a priority, mapping NaN to zero.
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value)
        }
    }

    /// Get the raw value.
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Position of an entry in the ordering.
///
/// `Reverse(seq)` makes older entries sort *after* newer ones within the
/// same priority, so the last key overall is the oldest highest-priority
/// entry.
type OrderKey = (Priority, Reverse<u64>);

/// A live queue entry.
#[derive(Debug, Clone)]
pub struct Entry<V> {
    /// The queued value.
    pub value: V,

    /// Current priority (higher = sooner).
    pub priority: f64,

    /// Monotonic insertion sequence, preserved across priority updates.
    pub seq: u64,

    /// When the entry was first admitted.
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new entry was created.
    Inserted,

    /// An existing entry had its priority replaced.
    Updated,
}

/// Priority queue keyed by item identity.
#[derive(Debug)]
pub struct IndexedPriorityQueue<K, V> {
    order: BTreeMap<OrderKey, K>,
    index: HashMap<K, Entry<V>>,
    next_seq: u64,
}

impl<K, V> Default for IndexedPriorityQueue<K, V>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> IndexedPriorityQueue<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns true if an entry exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Current priority of `key`, if queued.
    pub fn priority(&self, key: &K) -> Option<f64> {
        self.index.get(key).map(|e| e.priority)
    }

    /// Insert `key`, or replace its priority and value if already present.
    ///
    /// An update keeps the entry's original insertion position among equal
    /// priorities.
    pub fn upsert(&mut self, key: K, value: V, priority: f64, now: DateTime<Utc>) -> Upsert {
        let priority = Priority::new(priority);

        if let Some(entry) = self.index.get_mut(&key) {
            let seq = entry.seq;
            self.order.remove(&(Priority::new(entry.priority), Reverse(seq)));
            entry.priority = priority.value();
            entry.value = value;
            self.order.insert((priority, Reverse(seq)), key);
            return Upsert::Updated;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((priority, Reverse(seq)), key.clone());
        self.index.insert(
            key,
            Entry {
                value,
                priority: priority.value(),
                seq,
                enqueued_at: now,
            },
        );
        Upsert::Inserted
    }

    /// Remove and return the highest-priority entry (oldest among ties).
    pub fn pop_max(&mut self) -> Option<(K, Entry<V>)> {
        let (_, key) = self.order.pop_last()?;
        let entry = self.index.remove(&key)?;
        Some((key, entry))
    }

    /// Remove and return the lowest-priority entry (oldest among ties).
    pub fn evict_min(&mut self) -> Option<(K, Entry<V>)> {
        let (lowest, _) = self.order.first_key_value()?;
        let lowest = lowest.0;

        // Within one priority, keys run from newest to oldest.
        let oldest = self
            .order
            .range((lowest, Reverse(u64::MAX))..=(lowest, Reverse(0)))
            .next_back()
            .map(|(k, _)| *k)?;

        let key = self.order.remove(&oldest)?;
        let entry = self.index.remove(&key)?;
        Some((key, entry))
    }

    /// Remove the entry for `key`, if present.
    pub fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.index.remove(key)?;
        self.order
            .remove(&(Priority::new(entry.priority), Reverse(entry.seq)));
        Some(entry)
    }

    /// Peek at the entry that `pop_max` would return.
    pub fn peek_max(&self) -> Option<(&K, &Entry<V>)> {
        let (_, key) = self.order.last_key_value()?;
        self.index.get_key_value(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue() -> IndexedPriorityQueue<&'static str, ()> {
        IndexedPriorityQueue::new()
    }

    #[test]
    fn test_pop_highest_priority_first() {
        let mut q = queue();
        let now = Utc::now();
        q.upsert("low", (), 1.0, now);
        q.upsert("high", (), 10.0, now);
        q.upsert("mid", (), 5.0, now);

        assert_eq!(q.pop_max().map(|(k, _)| k), Some("high"));
        assert_eq!(q.pop_max().map(|(k, _)| k), Some("mid"));
        assert_eq!(q.pop_max().map(|(k, _)| k), Some("low"));
        assert!(q.pop_max().is_none());
    }

    #[test]
    fn test_equal_priorities_pop_fifo() {
        let mut q = queue();
        let now = Utc::now();
        q.upsert("a", (), 1.0, now);
        q.upsert("b", (), 1.0, now);
        q.upsert("c", (), 1.0, now);

        assert_eq!(q.pop_max().map(|(k, _)| k), Some("a"));
        assert_eq!(q.pop_max().map(|(k, _)| k), Some("b"));
        assert_eq!(q.pop_max().map(|(k, _)| k), Some("c"));
    }

    #[test]
    fn test_upsert_replaces_priority() {
        let mut q = queue();
        let now = Utc::now();
        assert_eq!(q.upsert("a", (), 1.0, now), Upsert::Inserted);
        assert_eq!(q.upsert("a", (), 7.0, now), Upsert::Updated);

        assert_eq!(q.len(), 1);
        assert_eq!(q.priority(&"a"), Some(7.0));
    }

    #[test]
    fn test_update_keeps_insertion_position() {
        let mut q = queue();
        let now = Utc::now();
        q.upsert("a", (), 2.0, now);
        q.upsert("b", (), 1.0, now);
        // Lowering "a" to tie with "b" keeps "a" ahead: it was admitted first.
        q.upsert("a", (), 1.0, now);

        assert_eq!(q.pop_max().map(|(k, _)| k), Some("a"));
    }

    #[test]
    fn test_evict_min_takes_oldest_of_lowest() {
        let mut q = queue();
        let now = Utc::now();
        q.upsert("old-low", (), 0.0, now);
        q.upsert("high", (), 5.0, now);
        q.upsert("new-low", (), 0.0, now);

        assert_eq!(q.evict_min().map(|(k, _)| k), Some("old-low"));
        assert_eq!(q.evict_min().map(|(k, _)| k), Some("new-low"));
        assert_eq!(q.evict_min().map(|(k, _)| k), Some("high"));
    }

    #[test]
    fn test_remove() {
        let mut q = queue();
        let now = Utc::now();
        q.upsert("a", (), 1.0, now);
        q.upsert("b", (), 2.0, now);

        assert!(q.remove(&"b").is_some());
        assert!(q.remove(&"b").is_none());
        assert!(!q.contains(&"b"));
        assert_eq!(q.peek_max().map(|(k, _)| *k), Some("a"));
    }

    #[test]
    fn test_nan_priority_is_zero() {
        let mut q = queue();
        let now = Utc::now();
        q.upsert("nan", (), f64::NAN, now);
        q.upsert("one", (), 1.0, now);

        assert_eq!(q.priority(&"nan"), Some(0.0));
        assert_eq!(q.evict_min().map(|(k, _)| k), Some("nan"));
    }

    proptest! {
        #[test]
        fn prop_pop_order_is_non_increasing(
            priorities in proptest::collection::vec(-100i32..100, 1..64),
        ) {
            let mut q: IndexedPriorityQueue<usize, ()> = IndexedPriorityQueue::new();
            let now = Utc::now();
            for (i, p) in priorities.iter().enumerate() {
                q.upsert(i, (), f64::from(*p), now);
            }

            let mut last: Option<(f64, u64)> = None;
            while let Some((_, entry)) = q.pop_max() {
                if let Some((prev_priority, prev_seq)) = last {
                    prop_assert!(entry.priority <= prev_priority);
                    if entry.priority == prev_priority {
                        prop_assert!(entry.seq > prev_seq);
                    }
                }
                last = Some((entry.priority, entry.seq));
            }
        }

        #[test]
        fn prop_evict_min_is_lowest(priorities in proptest::collection::vec(-100i32..100, 1..64)) {
            let mut q: IndexedPriorityQueue<usize, ()> = IndexedPriorityQueue::new();
            let now = Utc::now();
            for (i, p) in priorities.iter().enumerate() {
                q.upsert(i, (), f64::from(*p), now);
            }

            let min = priorities.iter().copied().min().map(f64::from);
            let evicted = q.evict_min().map(|(_, e)| e.priority);
            prop_assert_eq!(evicted, min);
        }
    }
}
