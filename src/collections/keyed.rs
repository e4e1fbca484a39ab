//! Ordered, key-unique entity store.

use crate::types::{Entity, EntityId};
use std::collections::{HashSet, VecDeque};

/// What a store mutation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entity was added.
    Inserted,
    /// An existing entity was replaced in place.
    Replaced,
    /// An entity was removed.
    Removed,
    /// Nothing changed (unknown key).
    Ignored,
}

/// Ordered collection of entities, unique by key, newest first.
///
/// Updates and deletes never reorder surviving entities. Every operation is
/// idempotent under retry of the same event.
#[derive(Clone, Debug)]
pub struct KeyedStore<T: Entity> {
    /// Entities in display order (front = most recent insert).
    entries: VecDeque<T>,
    /// Keys currently present.
    keys: HashSet<EntityId>,
}

impl<T: Entity> KeyedStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// Replace all contents, preserving the given order.
    ///
    /// If the batch repeats a key, the first occurrence wins.
    pub fn load(&mut self, initial: impl IntoIterator<Item = T>) {
        self.entries.clear();
        self.keys.clear();

        for entity in initial {
            if self.keys.insert(entity.id().clone()) {
                self.entries.push_back(entity);
            }
        }
    }

    /// Prepend a new entity, or replace it in place if the key exists.
    pub fn apply_insert(&mut self, entity: T) -> ApplyOutcome {
        if self.keys.contains(entity.id()) {
            return self.apply_update(entity);
        }

        self.keys.insert(entity.id().clone());
        self.entries.push_front(entity);
        ApplyOutcome::Inserted
    }

    /// Replace the entity with the same key; unknown keys are dropped.
    pub fn apply_update(&mut self, entity: T) -> ApplyOutcome {
        match self.position(entity.id()) {
            Some(index) => {
                self.entries[index] = entity;
                ApplyOutcome::Replaced
            }
            None => ApplyOutcome::Ignored,
        }
    }

    /// Remove the entity with this key, if present.
    pub fn apply_delete(&mut self, key: &EntityId) -> ApplyOutcome {
        if !self.keys.remove(key) {
            return ApplyOutcome::Ignored;
        }

        if let Some(index) = self.position(key) {
            self.entries.remove(index);
        }
        ApplyOutcome::Removed
    }

    pub fn get(&self, key: &EntityId) -> Option<&T> {
        self.position(key).map(|index| &self.entries[index])
    }

    pub fn contains(&self, key: &EntityId) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in display order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Keys in display order.
    pub fn keys(&self) -> Vec<EntityId> {
        self.entries.iter().map(|e| e.id().clone()).collect()
    }

    /// Owned copy of the current contents.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    fn position(&self, key: &EntityId) -> Option<usize> {
        if !self.keys.contains(key) {
            return None;
        }
        self.entries.iter().position(|e| e.id() == key)
    }
}

impl<T: Entity> Default for KeyedStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
