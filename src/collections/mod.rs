//! In-memory stores that hold reconciled remote rows.
//!
//! Keyed entities (invoices, field configurations) live in a
//! [`KeyedStore`]; append-only telemetry lives in a [`LogBuffer`].

mod keyed;
mod log_buffer;

pub use keyed::{ApplyOutcome, KeyedStore};
pub use log_buffer::LogBuffer;
