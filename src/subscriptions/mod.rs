//! Live change-stream subscriptions.
//!
//! A subscription is one registered interest in a remote table's mutations:
//! - Scoped to a [`Source`](crate::types::Source)
//! - Filtered by event kind and a row predicate
//! - Delivered in arrival order over a bounded channel
//!
//! Subscriptions are opened through the [`ChangeFeed`] trait; the
//! [`SubscriptionManager`] is the in-process implementation the remote
//! adapter pushes into.
//!
//! # Example
//!
//! ```ignore
//! let feed = SubscriptionManager::new();
//!
//! let config = SubscriptionConfig::new(Source::Invoices).with_filter(
//!     SubscriptionFilter::all().with_predicate(RowPredicate::eq("user_id", "u-1")),
//! );
//! let handle = feed.open(config)?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(FeedMessage::Change { event }) => println!("{} on {}", event.kind, event.source),
//!         Ok(FeedMessage::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! feed.close(handle.id);
//! ```

mod manager;
mod types;

pub use manager::{ChangeFeed, SubscriptionManager};
pub use types::{
    DropReason, FeedMessage, RowPredicate, SubscriptionConfig, SubscriptionFilter,
    SubscriptionHandle, SubscriptionId, DEFAULT_BUFFER_SIZE,
};
