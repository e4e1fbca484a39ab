//! Error types for the reconciliation engine.

use crate::subscriptions::SubscriptionId;
use crate::types::{ChangeKind, EntityId, Source};
use thiserror::Error;

/// Main error type for engine operations.
///
/// None of these are fatal. Each variant maps to a degraded but recoverable
/// state of the view or session that produced it.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The live stream could not be established; the view runs fetch-only.
    #[error("Subscription to {table} failed: {message}")]
    Subscription { table: Source, message: String },

    /// Initial bulk load failed; the store stays empty.
    #[error("Fetch of {table} failed: {message}")]
    Fetch { table: Source, message: String },

    /// An edit could not be persisted; the session keeps the edit.
    #[error("Commit of {key} failed: {message}")]
    Commit { key: EntityId, message: String },

    /// An event that makes no sense for its source (logged and dropped).
    #[error("Protocol violation on {table} ({kind}): {reason}")]
    ProtocolViolation {
        table: Source,
        kind: ChangeKind,
        reason: String,
    },

    /// Operation on a subscription that is already closed.
    #[error("Subscription {0} is closed")]
    StaleHandle(SubscriptionId),

    #[error("No authenticated user")]
    Unauthenticated,

    #[error("Cannot {action} while {state}")]
    InvalidTransition { state: String, action: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl EngineError {
    /// Whether this error should only be logged and dropped.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            EngineError::ProtocolViolation { .. } | EngineError::StaleHandle(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Decode(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
