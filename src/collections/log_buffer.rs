//! Capacity-limited buffer for append-only log entities.

use crate::types::Entity;
use std::collections::{HashSet, VecDeque};

/// Newest-first log tail that evicts the oldest entries past `capacity`.
///
/// Log entities are immutable, so there is no update or delete; eviction is
/// the only way an entry leaves the buffer.
#[derive(Clone, Debug)]
pub struct LogBuffer<T: Entity> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Entity> LogBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Prepend an entry, evicting from the tail if over capacity.
    ///
    /// Returns the number of evicted entries.
    pub fn append(&mut self, entry: T) -> usize {
        self.entries.push_front(entry);
        self.evict()
    }

    /// Replace contents with `initial` (newest first), truncated to capacity.
    pub fn load(&mut self, initial: impl IntoIterator<Item = T>) {
        self.entries.clear();
        self.entries
            .extend(initial.into_iter().take(self.capacity));
    }

    /// Load `initial`, then re-append entries that arrived live before it.
    ///
    /// `early` is in arrival order. Entries already present in `initial` are
    /// skipped since the fetch observed them.
    pub fn merge_load(&mut self, initial: impl IntoIterator<Item = T>, early: Vec<T>) {
        let initial: Vec<T> = initial.into_iter().collect();
        let seen: HashSet<_> = initial.iter().map(|e| e.id().clone()).collect();

        self.load(initial);
        for entry in early {
            if !seen.contains(entry.id()) {
                self.append(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate newest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    fn evict(&mut self) -> usize {
        let excess = self.entries.len().saturating_sub(self.capacity);
        self.entries.truncate(self.capacity);
        excess
    }
}
