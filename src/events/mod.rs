//! Capture, viewer and clip notifications
//!
//! Components publish [`SystemEvent`]s on a shared [`EventBus`]; the `/api/ws`
//! endpoint forwards them to browsers filtered by topic.

pub mod types;

pub use types::{ClientStats, SystemEvent};

use tokio::sync::broadcast;
use tracing::trace;

/// Events buffered per subscriber before it starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out of [`SystemEvent`]s to every current subscriber
///
/// Publishing never blocks. A subscriber that falls more than
/// `EVENT_CHANNEL_CAPACITY` events behind gets `RecvError::Lagged` and
/// resumes with the newest events.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Send to all subscribers; dropped when nobody listens
    pub fn publish(&self, event: SystemEvent) {
        let name = event.event_name();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!("Event {} delivered to {} subscribers", name, delivered);
    }

    /// Receive every event published from now on
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
