//! Application event surface
//!
//! The signaling core emits events instead of calling into the application
//! directly. Handlers are registered per event kind and invoked
//! synchronously on the signaling serialization domain.

use std::collections::HashMap;

use rmpv::Value;

use crate::error::CloseCode;
use crate::protocol::nonce::Address;
use crate::protocol::state::{SignalingChannel, SignalingState};

/// A notification from the signaling core to the application
#[derive(Debug, Clone)]
pub enum Event {
    /// The global signaling state changed
    StateChanged(SignalingState),
    /// The signaling channel moved (WebSocket vs data channel)
    ChannelChanged(SignalingChannel),
    /// The server could not deliver a message to the given peer
    ConnectionLost(Address),
    /// A peer left the path
    PeerDisconnected(Address),
    /// An `application` message arrived from the peer
    Data(Value),
    /// The transport closed with the given code
    Closed(Option<CloseCode>),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged(_) => EventKind::StateChanged,
            Self::ChannelChanged(_) => EventKind::ChannelChanged,
            Self::ConnectionLost(_) => EventKind::ConnectionLost,
            Self::PeerDisconnected(_) => EventKind::PeerDisconnected,
            Self::Data(_) => EventKind::Data,
            Self::Closed(_) => EventKind::Closed,
        }
    }
}

/// The kind of an [`Event`], used as subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChanged,
    ChannelChanged,
    ConnectionLost,
    PeerDisconnected,
    Data,
    Closed,
}

type Handler = Box<dyn FnMut(&Event) + Send>;

/// Per-kind handler lists
#[derive(Default)]
pub struct EventRegistry {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Invoke all handlers registered for the event's kind
    pub fn emit(&mut self, event: &Event) {
        if let Some(handlers) = self.handlers.get_mut(&event.kind()) {
            for handler in handlers.iter_mut() {
                handler(event);
            }
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<(EventKind, usize)> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        f.debug_struct("EventRegistry").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_subscribe_and_emit() {
        let mut registry = EventRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        registry.subscribe(EventKind::StateChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&Event::StateChanged(SignalingState::Task));
        registry.emit(&Event::StateChanged(SignalingState::Closed));
        // Different kind, handler must not fire
        registry.emit(&Event::Closed(None));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_multiple_handlers_per_kind() {
        let mut registry = EventRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = seen.clone();
            registry.subscribe(EventKind::Data, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.emit(&Event::Data(Value::Nil));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
