//! Stores as reconciliation targets.

use crate::collections::{ApplyOutcome, KeyedStore, LogBuffer};
use crate::error::{EngineError, Result};
use crate::types::{decode_row, ChangeKind, Entity, EntityId};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

/// A store shared between its reconciler (writer) and readers.
pub type Shared<S> = Arc<RwLock<S>>;

/// An event that was applied before the bulk load of its store resolved.
#[derive(Clone, Debug)]
pub struct JournaledEvent {
    pub kind: ChangeKind,
    pub record: serde_json::Value,
}

/// Result of applying a bulk load to a target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Rows taken from the fetched batch.
    pub loaded: usize,
    /// Rows of the batch that could not be decoded.
    pub skipped: usize,
    /// Early live events replayed on top of the batch.
    pub replayed: usize,
    /// The batch was discarded because events it needed were lost; fetch again.
    pub resync: bool,
}

/// A store the reconciler can route events into.
pub trait ChangeTarget: Send + Sync {
    /// Apply one live event.
    fn apply(&self, kind: ChangeKind, record: &serde_json::Value) -> Result<ApplyOutcome>;

    /// Replace contents with a fetched batch, then replay `early` events.
    ///
    /// Readers never observe the intermediate state.
    fn load(&self, rows: &[serde_json::Value], early: &[JournaledEvent]) -> Result<LoadReport>;
}

/// Decode a batch, skipping rows that do not fit the entity type.
fn decode_batch<T: Entity>(rows: &[serde_json::Value]) -> (Vec<T>, usize) {
    let mut decoded = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        match decode_row::<T>(row) {
            Ok(entity) => decoded.push(entity),
            Err(e) => {
                warn!(table = %T::SOURCE, error = %e, "skipping undecodable row in bulk load");
                skipped += 1;
            }
        }
    }
    (decoded, skipped)
}

fn delete_key(record: &serde_json::Value) -> Result<EntityId> {
    record
        .get("id")
        .and_then(|v| v.as_str())
        .map(EntityId::from)
        .ok_or_else(|| EngineError::Decode("delete event without string id".to_string()))
}

fn apply_keyed<T: Entity>(
    store: &mut KeyedStore<T>,
    kind: ChangeKind,
    record: &serde_json::Value,
) -> Result<ApplyOutcome> {
    match kind {
        ChangeKind::Insert => Ok(store.apply_insert(decode_row(record)?)),
        ChangeKind::Update => Ok(store.apply_update(decode_row(record)?)),
        ChangeKind::Delete => Ok(store.apply_delete(&delete_key(record)?)),
    }
}

impl<T: Entity> ChangeTarget for Shared<KeyedStore<T>> {
    fn apply(&self, kind: ChangeKind, record: &serde_json::Value) -> Result<ApplyOutcome> {
        // Decode before taking the lock; a bad row must not touch the store.
        match kind {
            ChangeKind::Insert => {
                let entity = decode_row::<T>(record)?;
                Ok(self.write().apply_insert(entity))
            }
            ChangeKind::Update => {
                let entity = decode_row::<T>(record)?;
                Ok(self.write().apply_update(entity))
            }
            ChangeKind::Delete => {
                let key = delete_key(record)?;
                Ok(self.write().apply_delete(&key))
            }
        }
    }

    fn load(&self, rows: &[serde_json::Value], early: &[JournaledEvent]) -> Result<LoadReport> {
        let (entities, skipped) = decode_batch::<T>(rows);
        let mut fresh = KeyedStore::new();
        fresh.load(entities);
        let loaded = fresh.len();

        let mut replayed = 0;
        for event in early {
            // Journaled events already decoded once; failures here are not expected.
            if apply_keyed(&mut fresh, event.kind, &event.record).is_ok() {
                replayed += 1;
            }
        }

        *self.write() = fresh;
        Ok(LoadReport {
            loaded,
            skipped,
            replayed,
            resync: false,
        })
    }
}

impl<T: Entity> ChangeTarget for Shared<LogBuffer<T>> {
    fn apply(&self, kind: ChangeKind, record: &serde_json::Value) -> Result<ApplyOutcome> {
        if kind != ChangeKind::Insert {
            return Err(EngineError::ProtocolViolation {
                table: T::SOURCE,
                kind,
                reason: "log entries are append-only".to_string(),
            });
        }

        let entry = decode_row::<T>(record)?;
        self.write().append(entry);
        Ok(ApplyOutcome::Inserted)
    }

    fn load(&self, rows: &[serde_json::Value], early: &[JournaledEvent]) -> Result<LoadReport> {
        let (entries, skipped) = decode_batch::<T>(rows);
        let early: Vec<T> = early
            .iter()
            .filter(|e| e.kind == ChangeKind::Insert)
            .filter_map(|e| decode_row::<T>(&e.record).ok())
            .collect();
        let replayed = early.len();

        let mut buffer = self.write();
        let loaded = entries.len().min(buffer.capacity());
        buffer.merge_load(entries, early);

        Ok(LoadReport {
            loaded,
            skipped,
            replayed,
            resync: false,
        })
    }
}
