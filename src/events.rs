//! Synchronous publish/subscribe event bus.
//!
//! Handlers are keyed by event type, with a wildcard `*` bucket that
//! receives everything. Publishing runs handlers inline on the caller;
//! a panicking subscriber is contained and never affects the publisher
//! or the remaining subscribers.
//!
//! Async consumers (the API layer's streaming bridge) attach through
//! [`EventBus::subscribe_queue`], which enqueues into a bounded channel
//! and drops on overflow rather than blocking the publisher.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::models::AgentEvent;

/// Wildcard subscription key.
pub const WILDCARD: &str = "*";

/// Capacity of a bridged subscriber queue. Slow consumers lose events
/// rather than stalling monitors.
const QUEUE_CAPACITY: usize = 256;

type Handler = Box<dyn Fn(&AgentEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Internal publish/subscribe event bus.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to events of a specific type, or `*` for all events.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().expect("event bus lock poisoned");
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns true if it was registered.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().expect("event bus lock poisoned");
        if let Some(list) = handlers.get_mut(event_type) {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            return list.len() != before;
        }
        false
    }

    /// Publish an event to type-specific handlers, then wildcard handlers.
    ///
    /// Handlers run synchronously in subscription order. Panics are
    /// swallowed so a misbehaving subscriber cannot break the publisher.
    pub fn publish(&self, event: &AgentEvent) {
        let handlers = self.handlers.read().expect("event bus lock poisoned");
        if let Some(list) = handlers.get(&event.event_type) {
            for (_, handler) in list {
                let _ = catch_unwind(AssertUnwindSafe(|| handler(event)));
            }
        }
        if let Some(list) = handlers.get(WILDCARD) {
            for (_, handler) in list {
                let _ = catch_unwind(AssertUnwindSafe(|| handler(event)));
            }
        }
    }

    /// Subscribe through a bounded queue for async consumption.
    ///
    /// Events that arrive while the queue is full are dropped; the
    /// publisher never blocks on a slow consumer.
    pub fn subscribe_queue(
        &self,
        event_type: &str,
    ) -> (SubscriptionId, async_channel::Receiver<AgentEvent>) {
        let (tx, rx) = async_channel::bounded(QUEUE_CAPACITY);
        let id = self.subscribe(event_type, move |event| {
            let _ = tx.try_send(event.clone());
        });
        (id, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    fn event(event_type: &str) -> AgentEvent {
        AgentEvent::new("agent-1", event_type, json!({}))
    }

    #[test]
    fn test_specific_then_wildcard_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        bus.subscribe("state_change", move |_| s1.lock().unwrap().push("specific"));
        let s2 = seen.clone();
        bus.subscribe(WILDCARD, move |_| s2.lock().unwrap().push("wildcard"));

        bus.publish(&event("state_change"));
        assert_eq!(*seen.lock().unwrap(), vec!["specific", "wildcard"]);
    }

    #[test]
    fn test_all_events_delivered_in_publish_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(WILDCARD, move |e| {
            s.lock().unwrap().push(e.detail["n"].as_i64().unwrap())
        });

        for n in 0..20 {
            bus.publish(&AgentEvent::new("a", "output", json!({ "n": n })));
        }
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_handler_does_not_break_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe("probe", |_| panic!("bad subscriber"));
        let c = count.clone();
        bus.subscribe("probe", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&event("probe"));
        bus.publish(&event("probe"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe("output", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&event("output"));
        assert!(bus.unsubscribe("output", id));
        bus.publish(&event("output"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!bus.unsubscribe("output", id));
    }

    #[test]
    fn test_unmatched_type_is_ignored() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe("timeout", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&event("output"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_queue_bridge_receives_events() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe_queue("agent_finished");
        bus.publish(&event("agent_finished"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "agent_finished");
    }

    #[tokio::test]
    async fn test_queue_drops_on_overflow() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe_queue("output");
        // Fill well past capacity without draining.
        for n in 0..300 {
            bus.publish(&AgentEvent::new("a", "output", json!({ "n": n })));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 256);
    }
}
