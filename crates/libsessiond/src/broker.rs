use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::trace;

use sessiond_protocol::{Event, EventKind};

pub type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Fans service events out to in-process listeners and async subscribers.
///
/// Delivery is fire-and-forget: no acknowledgment, and a subscriber that lags
/// behind the buffer skips events. Contexts re-query `getSessions` as the
/// source of truth.
pub struct EventBroadcaster {
    sender: broadcast::Sender<Event>,
    listeners: HashMap<EventKind, Vec<Listener>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: HashMap::new(),
        }
    }

    /// Register a listener called synchronously for every event of `kind`.
    pub fn on<F>(&mut self, kind: EventKind, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners
            .entry(kind)
            .or_default()
            .push(Box::new(listener));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Sender handle for adapters that subscribe without access to the service.
    pub fn sender(&self) -> broadcast::Sender<Event> {
        self.sender.clone()
    }

    /// Publish an event. Returns how many async subscribers received it.
    pub fn emit(&self, event: Event) -> usize {
        if let Some(listeners) = self.listeners.get(&event.kind()) {
            for listener in listeners {
                listener(&event);
            }
        }
        // No subscribers just means nobody is connected.
        let delivered = self.sender.send(event).unwrap_or(0);
        trace!(delivered, "event broadcast");
        delivered
    }

    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
