//! Refresh notifications.
//!
//! Emitted after each stored chunk and each completed refresh. Publishing
//! never blocks; subscribers that fall behind lose the oldest events.

use log::warn;
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Something a fetcher just did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RefreshEvent {
    /// A chunk was written to the cache.
    ChunkStored {
        fetcher: String,
        tier: String,
        items: usize,
    },
    /// A tier refresh finished successfully.
    TierCompleted {
        fetcher: String,
        tier: String,
        items: usize,
    },
    /// A non-tiered refresh finished successfully.
    RefreshCompleted { fetcher: String, items: usize },
}

impl RefreshEvent {
    pub fn fetcher(&self) -> &str {
        match self {
            Self::ChunkStored { fetcher, .. }
            | Self::TierCompleted { fetcher, .. }
            | Self::RefreshCompleted { fetcher, .. } => fetcher,
        }
    }

    /// True for the once-per-refresh completion events.
    pub fn is_completion(&self) -> bool {
        !matches!(self, Self::ChunkStored { .. })
    }
}

/// Broadcast bus that fans refresh events out to any subscriber.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RefreshEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: RefreshEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A subscriber's handle. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<RefreshEvent>,
}

impl Subscription {
    /// Next event, skipping over any this subscriber missed. `None` once the
    /// bus is gone.
    pub async fn recv(&mut self) -> Option<RefreshEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<RefreshEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
