//! Live-event fan-out
//!
//! One broadcast channel feeds every connected SSE client. Slow receivers
//! lag and drop events instead of blocking the push path; a client that
//! missed events recovers on its next pull anyway.

use ordo_core::protocol::SyncEvent;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out hub for sync notifications
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Register a new SSE client.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Broadcast one event; a send without receivers is not an error.
    pub fn send(&self, event: SyncEvent) {
        let receivers = self.tx.send(event).unwrap_or(0);
        tracing::trace!(receivers, "sync event broadcast");
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
