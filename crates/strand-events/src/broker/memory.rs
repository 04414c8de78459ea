//! In-memory broker implementation.
//!
//! Suitable for tests and single-process deployments. Delivery is
//! per-subscriber FIFO via unbounded channels; a slow subscriber buffers
//! rather than blocking publishers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{channel_matches, BrokerMessage, MessageBroker, Subscription};
use crate::error::{Error, Result};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::broker("broker registry lock poisoned")
}

struct SubscriberEntry {
    pattern: String,
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

/// In-process publish/subscribe broker.
#[derive(Default)]
pub struct InMemoryBroker {
    subscribers: Arc<RwLock<HashMap<u64, SubscriberEntry>>>,
    next_id: AtomicU64,
}

impl InMemoryBroker {
    /// Creates a new broker with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn subscriber_count(&self) -> Result<usize> {
        Ok(self.subscribers.read().map_err(poison_err)?.len())
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let subscribers = self.subscribers.read().map_err(poison_err)?;
        for entry in subscribers.values() {
            if channel_matches(&entry.pattern, channel) {
                // A closed receiver means the subscriber is tearing down;
                // losing the message is fine.
                let _ = entry.sender.send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers.write().map_err(poison_err)?.insert(
            id,
            SubscriberEntry {
                pattern: pattern.to_string(),
                sender,
            },
        );

        let registry = Arc::clone(&self.subscribers);
        let closer = Box::new(move || {
            if let Ok(mut subscribers) = registry.write() {
                subscribers.remove(&id);
            }
        });

        Ok(Subscription::new(pattern, receiver, closer))
    }
}
