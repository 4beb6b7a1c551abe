//! Status events of the video subsystem
//!
//! Workers publish on an [`EventBus`] from plain threads; the CLI and any
//! embedding process read them from a tokio broadcast receiver.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Events kept for a slow subscriber before it sees `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Fan-out of [`SystemEvent`]s; `publish` never blocks
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to current subscribers; dropped when there are none
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
