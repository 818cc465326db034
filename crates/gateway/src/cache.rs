//! Fixed-capacity replay cache for one sub-stream.

use std::collections::VecDeque;

/// Circular buffer holding the most recent `capacity` entries in arrival
/// order. Appending to a full cache evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct MessageCache<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> MessageCache<T> {
    /// Create an empty cache. A zero capacity caches nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
