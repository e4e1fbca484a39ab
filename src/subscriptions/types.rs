//! Subscription types for live change streams.

use crate::types::{ChangeEvent, ChangeKind, Source};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of buffered messages before a subscriber is dropped.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Remote table to watch.
    pub source: Source,

    /// Which events of that table are delivered.
    pub filter: SubscriptionFilter,

    /// Max buffered messages before dropping the subscriber.
    /// Default: 1000
    pub buffer_size: usize,
}

impl SubscriptionConfig {
    /// Watch every event of `source`.
    pub fn new(source: Source) -> Self {
        Self {
            source,
            filter: SubscriptionFilter::all(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// Row-level predicate, e.g. `user_id = <current user>` or `id = <watched id>`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum RowPredicate {
    /// Every row.
    #[default]
    All,
    /// Rows whose `column` equals `value`.
    Eq { column: String, value: String },
}

impl RowPredicate {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        RowPredicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Evaluate against a wire row.
    ///
    /// Strings compare verbatim; numbers and booleans by their JSON text.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match self {
            RowPredicate::All => true,
            RowPredicate::Eq { column, value } => match row.get(column) {
                Some(serde_json::Value::String(s)) => s == value,
                Some(serde_json::Value::Null) | None => false,
                Some(other) => other.to_string() == *value,
            },
        }
    }
}

impl fmt::Display for RowPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowPredicate::All => f.write_str("*"),
            RowPredicate::Eq { column, value } => write!(f, "{}=eq.{}", column, value),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Event kinds to deliver (None = all kinds).
    pub kinds: Option<Vec<ChangeKind>>,

    /// Row predicate.
    pub predicate: RowPredicate,
}

impl SubscriptionFilter {
    /// Every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only events of the given kinds.
    pub fn kinds(kinds: Vec<ChangeKind>) -> Self {
        Self {
            kinds: Some(kinds),
            ..Default::default()
        }
    }

    /// Only inserts (log tails).
    pub fn inserts() -> Self {
        Self::kinds(vec![ChangeKind::Insert])
    }

    pub fn with_predicate(mut self, predicate: RowPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Check an event against kind and row predicate.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        self.predicate.matches(&event.record)
    }
}

/// Messages delivered on a subscription channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// A change event matching the subscription filter.
    Change { event: ChangeEvent },

    /// Subscription was dropped; no further messages follow.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Channel closed without a drop notice.
    Disconnected,
    /// The feed stopped.
    Shutdown,
    /// Explicitly closed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle to one open subscription.
///
/// Owned by whoever opened it; closing goes through the feed that issued it.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub source: Source,
    /// Channel to receive messages.
    pub receiver: crossbeam_channel::Receiver<FeedMessage>,
}

impl SubscriptionHandle {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> Result<FeedMessage, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> Result<FeedMessage, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<FeedMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish()
    }
}
