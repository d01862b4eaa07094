//! Radix Heap Set
//!
//! A monotone bucketed priority queue keyed by item. It backs every
//! [`TimerSet`](super::TimerSet): priorities are time quanta, and the
//! "last extracted" floor only ever moves forward.
//!
//! # How It Works
//!
//! Items live in 65 buckets. Bucket 0 holds items whose priority equals the
//! last extracted minimum; bucket `i > 0` holds items whose priority differs
//! from that minimum first at bit `i - 1`. Extracting the minimum empties
//! bucket 0 or, when it is empty, redistributes the first non-empty bucket
//! around its own minimum. Each item moves down at most 64 times over its
//! lifetime, so extraction is amortized O(bucket).
//!
//! An item can be present at most once; re-adding it moves it.

use std::collections::HashMap;
use std::hash::Hash;

const BUCKET_COUNT: usize = 65;

/// Monotone radix heap with set semantics.
#[derive(Debug)]
pub struct RadixHeapSet<T>
where
    T: Hash + Eq + Clone,
{
    buckets: Vec<HashMap<T, u64>>,
    priorities: HashMap<T, u64>,
    last: u64,
}

impl<T> RadixHeapSet<T>
where
    T: Hash + Eq + Clone,
{
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| HashMap::new()).collect(),
            priorities: HashMap::new(),
            last: 0,
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.priorities.len()
    }

    /// Whether the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    /// The floor: no item can have a lower priority than this.
    pub fn floor(&self) -> u64 {
        self.last
    }

    /// Current priority of `item`, if present.
    pub fn priority_of(&self, item: &T) -> Option<u64> {
        self.priorities.get(item).copied()
    }

    /// Insert `item` or move it to `priority`.
    ///
    /// Priorities below the floor are clamped up to it.
    pub fn add_or_update(&mut self, priority: u64, item: T) {
        self.remove(&item);
        self.insert(priority, item);
    }

    /// Insert `item`, or move it only if `priority` is strictly lower than its
    /// current one. Returns whether the item was inserted or moved.
    pub fn add_or_update_to_lower(&mut self, priority: u64, item: T) -> bool {
        let priority = priority.max(self.last);
        match self.priorities.get(&item) {
            Some(&current) if current <= priority => false,
            _ => {
                self.add_or_update(priority, item);
                true
            }
        }
    }

    /// Insert `item`, or move it only if `priority` is strictly higher than
    /// its current one. Returns whether the item was inserted or moved.
    pub fn add_or_update_to_higher(&mut self, priority: u64, item: T) -> bool {
        let priority = priority.max(self.last);
        match self.priorities.get(&item) {
            Some(&current) if current >= priority => false,
            _ => {
                self.add_or_update(priority, item);
                true
            }
        }
    }

    /// Remove `item`, returning its priority if it was present.
    pub fn remove(&mut self, item: &T) -> Option<u64> {
        let priority = self.priorities.remove(item)?;
        let bucket = self.bucket_of(priority);
        self.buckets[bucket].remove(item);
        Some(priority)
    }

    /// The lowest priority currently stored.
    pub fn peek_min_priority(&self) -> Option<u64> {
        if !self.buckets[0].is_empty() {
            return Some(self.last);
        }
        self.buckets
            .iter()
            .skip(1)
            .find(|bucket| !bucket.is_empty())
            .and_then(|bucket| bucket.values().copied().min())
    }

    /// Remove and return every item sharing the minimum priority, provided
    /// that priority is `<= max_priority`.
    pub fn extract_min_set(&mut self, max_priority: u64) -> Vec<(T, u64)> {
        if self.buckets[0].is_empty() {
            let Some(index) = self.buckets.iter().position(|bucket| !bucket.is_empty()) else {
                return Vec::new();
            };
            let min = self.buckets[index]
                .values()
                .copied()
                .min()
                .unwrap_or(self.last);
            if min > max_priority {
                return Vec::new();
            }

            self.last = min;
            let moved = std::mem::take(&mut self.buckets[index]);
            for (item, priority) in moved {
                let bucket = self.bucket_of(priority);
                self.buckets[bucket].insert(item, priority);
            }
        } else if self.last > max_priority {
            return Vec::new();
        }

        let extracted: Vec<(T, u64)> = self.buckets[0].drain().collect();
        for (item, _) in &extracted {
            self.priorities.remove(item);
        }
        extracted
    }

    /// Remove and return every item with priority `<= max_priority`.
    pub fn extract_due(&mut self, max_priority: u64) -> Vec<(T, u64)> {
        let mut due = Vec::new();
        loop {
            let set = self.extract_min_set(max_priority);
            if set.is_empty() {
                return due;
            }
            due.extend(set);
        }
    }

    fn insert(&mut self, priority: u64, item: T) {
        let priority = priority.max(self.last);
        let bucket = self.bucket_of(priority);
        self.priorities.insert(item.clone(), priority);
        self.buckets[bucket].insert(item, priority);
    }

    fn bucket_of(&self, priority: u64) -> usize {
        if priority == self.last {
            0
        } else {
            64 - (priority ^ self.last).leading_zeros() as usize
        }
    }
}

impl<T> Default for RadixHeapSet<T>
where
    T: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
