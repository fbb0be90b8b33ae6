//! Event subscriptions.

use crate::message::Message;
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};
use uuid::Uuid;

/// Receives published events.
pub trait EventListener: Send + Sync {
    /// Returns `true` to end the subscription.
    fn handle_event(&self, event: &Message) -> bool;
}

impl<F> EventListener for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn handle_event(&self, event: &Message) -> bool {
        self(event)
    }
}

type Listeners = DashMap<Uuid, Arc<dyn EventListener>>;

#[derive(Default)]
struct Tables {
    by_key: DashMap<String, Listeners>,
    /// Subscription -> the event keys it listens on.
    keys: DashMap<Uuid, Vec<String>>,
}

impl Tables {
    fn remove(&self, id: Uuid, key: &str) {
        if let Some(listeners) = self.by_key.get(key) {
            listeners.remove(&id);
        }
        self.by_key.remove_if(key, |_, listeners| listeners.is_empty());
    }

    fn remove_all(&self, id: Uuid) {
        if let Some((_, keys)) = self.keys.remove(&id) {
            for key in keys {
                self.remove(id, &key);
            }
        }
    }
}

/// Event key -> listeners.
#[derive(Default)]
pub struct EventRegistry {
    tables: Arc<Tables>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to every key in `keys` (event type names, or
    /// [`crate::message::API_EVENT_TYPE`] for API events).
    pub fn subscribe(&self, listener: Arc<dyn EventListener>, keys: &[&str]) -> EventSubscription {
        let id = Uuid::new_v4();
        let mut owned: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        owned.sort();
        owned.dedup();

        self.tables.keys.insert(id, owned.clone());
        for key in &owned {
            self.tables
                .by_key
                .entry(key.clone())
                .or_default()
                .insert(id, listener.clone());
        }

        EventSubscription {
            id,
            keys: owned,
            tables: Arc::downgrade(&self.tables),
        }
    }

    /// Calls every listener subscribed to the event's key.
    ///
    /// A panicking listener is logged and skipped. Returns the number of
    /// listeners called.
    pub fn dispatch(&self, event: &Message) -> usize {
        let Some(key) = event.event_key() else {
            return 0;
        };

        let snapshot: Vec<(Uuid, Arc<dyn EventListener>)> = match self.tables.by_key.get(key) {
            Some(listeners) => listeners.iter().map(|l| (*l.key(), l.value().clone())).collect(),
            None => return 0,
        };

        for (id, listener) in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.handle_event(event))) {
                Ok(true) => {
                    trace!(subscription = %id, key, "listener finished, unsubscribing");
                    self.tables.remove_all(*id);
                }
                Ok(false) => {}
                Err(_) => {
                    warn!(subscription = %id, event = %event.describe(), "event listener panicked");
                }
            }
        }
        snapshot.len()
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.tables.by_key.get(key).map(|l| l.len()).unwrap_or(0)
    }
}

/// Handle returned by [`EventRegistry::subscribe`].
#[derive(Debug, Clone)]
pub struct EventSubscription {
    id: Uuid,
    keys: Vec<String>,
    tables: Weak<Tables>,
}

impl EventSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Stops listening on one key.
    pub fn unsubscribe(&self, key: &str) {
        let Some(tables) = self.tables.upgrade() else {
            return;
        };
        tables.remove(self.id, key);
        if let Some(mut keys) = tables.keys.get_mut(&self.id) {
            keys.retain(|k| k != key);
        }
        tables.keys.remove_if(&self.id, |_, keys| keys.is_empty());
    }

    pub fn unsubscribe_all(&self) {
        if let Some(tables) = self.tables.upgrade() {
            tables.remove_all(self.id);
        }
    }
}

impl std::fmt::Debug for Tables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tables")
            .field("keys", &self.by_key.len())
            .field("subscriptions", &self.keys.len())
            .finish()
    }
}
