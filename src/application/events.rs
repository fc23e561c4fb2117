//! Publish/subscribe notification for lifecycle events.
//!
//! Handlers are registered per event kind and invoked synchronously at the
//! publishing site, so one subscriber observes a given server's events in
//! the order that server produced them.

use crate::domain::types::{EventKind, GatewayEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Handler = Arc<dyn Fn(&GatewayEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&GatewayEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        subscribers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        let mut removed = false;
        for handlers in subscribers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    pub fn publish(&self, event: GatewayEvent) {
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.lock().expect("subscriber lock");
            subscribers
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(&event);
        }
    }
}
