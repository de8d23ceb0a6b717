//! Synchronous publish/subscribe keyed by event type.
//!
//! Handlers run on the publisher's task, in subscription order. Game logic on
//! the client hangs off this bus rather than reading the socket directly.

use crate::{Event, EventType};
use std::collections::HashMap;

type Handler = Box<dyn FnMut(&Event) + Send>;

/// Token returned by [`EventBus::subscribe`], used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventType,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventType {
        self.kind
    }
}

#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    handlers: HashMap<EventType, Vec<(u64, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, kind: EventType, handler: F) -> Subscription
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        Subscription { kind, id }
    }

    /// Removes a handler. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let Some(handlers) = self.handlers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription.id);
        before != handlers.len()
    }

    /// Delivers `event` to every handler registered for its type. Returns the
    /// number of handlers invoked.
    pub fn publish(&mut self, event: &Event) -> usize {
        match self.handlers.get_mut(&event.kind()) {
            Some(handlers) => {
                for (_, handler) in handlers.iter_mut() {
                    handler(event);
                }
                handlers.len()
            }
            None => 0,
        }
    }

    pub fn handler_count(&self, kind: EventType) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<EventType, usize> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LeavePayload, Payload, PlayerId};
    use std::sync::{Arc, Mutex};

    fn leave(id: &str) -> Event {
        Event::new(Payload::Leave(LeavePayload {
            player_id: PlayerId::new(id),
        }))
    }

    #[test]
    fn test_publish_reaches_matching_handlers_in_order() {
        let mut bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventType::Leave, move |_| seen.lock().unwrap().push(tag));
        }
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventType::Join, move |_| seen.lock().unwrap().push("join"));
        }

        assert_eq!(bus.publish(&leave("a")), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_publish_without_handlers() {
        let mut bus = EventBus::new();
        assert_eq!(bus.publish(&leave("a")), 0);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let mut bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));

        let first = {
            let hits = Arc::clone(&hits);
            bus.subscribe(EventType::Leave, move |_| *hits.lock().unwrap() += 1)
        };
        {
            let hits = Arc::clone(&hits);
            bus.subscribe(EventType::Leave, move |_| *hits.lock().unwrap() += 10);
        }

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        assert_eq!(bus.handler_count(EventType::Leave), 1);

        bus.publish(&leave("a"));
        assert_eq!(*hits.lock().unwrap(), 10);
    }
}
