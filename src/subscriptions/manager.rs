//! Change feed seam and the in-process subscription manager.

use crate::error::{EngineError, Result};
use crate::types::ChangeEvent;
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

use super::types::{
    DropReason, FeedMessage, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};

/// Source of live change events.
///
/// `open` registers interest in one table; `close` stops delivery. Closing
/// must be idempotent: a second close, or a close for an id the feed never
/// issued, returns `false` and does nothing else.
pub trait ChangeFeed: Send + Sync {
    fn open(&self, config: SubscriptionConfig) -> Result<SubscriptionHandle>;

    fn close(&self, id: SubscriptionId) -> bool;
}

/// Internal subscription state.
struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<FeedMessage>,
}

impl Subscription {
    /// Try to send a message. Returns false if the subscriber must be dropped.
    fn try_send(&self, message: FeedMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }

    /// Check if this subscription wants the event.
    fn matches(&self, event: &ChangeEvent) -> bool {
        self.config.source == event.source && self.config.filter.matches(event)
    }
}

/// In-process change feed.
///
/// The remote adapter pushes events with [`broadcast`](Self::broadcast);
/// each matching subscriber receives them in push order on its own bounded
/// channel. Subscribers that fall behind are dropped.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Cleared by `shutdown`; new subscriptions are refused afterwards.
    accepting: AtomicBool,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
        }
    }

    /// Create a new subscription.
    pub fn subscribe(&self, config: SubscriptionConfig) -> Result<SubscriptionHandle> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::Subscription {
                table: config.source,
                message: "feed is shut down".to_string(),
            });
        }
        if config.buffer_size == 0 {
            return Err(EngineError::Subscription {
                table: config.source,
                message: "buffer size must be positive".to_string(),
            });
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);
        let source = config.source;

        debug!(
            subscription = %id,
            table = %source,
            filter = %config.filter.predicate,
            "subscription opened"
        );
        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        Ok(SubscriptionHandle {
            id,
            source,
            receiver,
        })
    }

    /// Unsubscribe and clean up. Returns false if already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.write().remove(&id);
        match removed {
            Some(sub) => {
                // Best effort; the receiver may already be gone.
                let _ = sub.sender.try_send(FeedMessage::Dropped {
                    reason: DropReason::Unsubscribed,
                });
                debug!(subscription = %id, "subscription closed");
                true
            }
            None => {
                debug!(subscription = %id, "close on stale subscription ignored");
                false
            }
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Drop every subscriber and refuse new ones.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let drained: Vec<_> = self.subscriptions.write().drain().collect();
        for (_, sub) in drained {
            let _ = sub.sender.try_send(FeedMessage::Dropped {
                reason: DropReason::Shutdown,
            });
        }
    }

    /// Deliver an event to every matching subscription.
    ///
    /// Returns the number of subscribers that received it.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        let mut delivered = 0;
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if !sub.matches(event) {
                    continue;
                }
                if sub.try_send(FeedMessage::Change {
                    event: event.clone(),
                }) {
                    delivered += 1;
                } else {
                    to_remove.push(*id);
                }
            }
        }

        // Remove dropped subscriptions
        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    warn!(subscription = %id, table = %sub.config.source, "slow subscriber dropped");
                    // Full buffer: this lands only if the consumer caught up meanwhile.
                    let _ = sub.sender.try_send(FeedMessage::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }

        delivered
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed for SubscriptionManager {
    fn open(&self, config: SubscriptionConfig) -> Result<SubscriptionHandle> {
        self.subscribe(config)
    }

    fn close(&self, id: SubscriptionId) -> bool {
        self.unsubscribe(id)
    }
}
