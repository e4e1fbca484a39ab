//! Reconciliation of change events into local stores.
//!
//! The [`Reconciler`] routes each event to the store bound to its source and
//! applies the per-store merge policy. While any bulk fetch of a store is
//! outstanding, live events are applied and journaled so each load can be
//! merged with them instead of overwriting them.

mod reconciler;
mod target;

pub use reconciler::{LoadTicket, Reconciled, Reconciler};
pub use target::{ChangeTarget, JournaledEvent, LoadReport, Shared};
