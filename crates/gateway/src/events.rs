// Push Event Subscribers
//
// Gateway-originated events are delivered to registered handlers, in
// registration order, from the client's single dispatch task.

use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};

/// Event name matching every pushed event
pub const ANY_EVENT: &str = "*";

pub type EventHandler = Arc<dyn Fn(&str, &JsonValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    event: String,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Subscription>,
}

/// Ordered list of event handlers
#[derive(Default)]
pub struct EventSubscribers {
    registry: Mutex<Registry>,
}

impl EventSubscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event` (or [`ANY_EVENT`])
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &JsonValue) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.entries.push(Subscription {
            id,
            event: event.into(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|s| s.id != id);
        registry.entries.len() != before
    }

    /// Invoke every matching handler; returns how many ran.
    ///
    /// Handlers run outside the registry lock so they may subscribe or
    /// unsubscribe themselves.
    pub fn emit(&self, event: &str, payload: &JsonValue) -> usize {
        let handlers: Vec<EventHandler> = self
            .lock()
            .entries
            .iter()
            .filter(|s| s.event == event || s.event == ANY_EVENT)
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in &handlers {
            handler(event, payload);
        }
        handlers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}
