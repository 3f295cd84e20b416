//! Local event dispatch: maps application event names to the callbacks
//! subscribed on this node.
//!
//! Callbacks are invoked in subscription order. The subscriber list is
//! snapshotted before invocation, so a callback may subscribe further
//! handlers (they take effect from the next dispatch) without deadlocking.

use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{trace, warn};

/// A subscribed callback.
pub type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;

/// Event-name to callbacks registry.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: DashMap<String, Vec<Subscriber>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `callback` to the list for `event`.
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribers
            .entry(event.into())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Subscribes a callback that receives the payload deserialized as `T`.
    /// Payloads that do not fit `T` are logged and skipped.
    pub fn subscribe_as<T, F>(&self, event: impl Into<String>, callback: F)
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let event = event.into();
        let name = event.clone();
        self.subscribe(event, move |payload| {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(value) => callback(value),
                Err(e) => warn!(event = %name, error = %e, "payload does not match subscriber type"),
            }
        });
    }

    /// Invokes every callback subscribed to `event` with `payload`.
    /// Returns the number of callbacks invoked; zero is not an error.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let snapshot: Vec<Subscriber> = match self.subscribers.get(event) {
            Some(list) => list.value().clone(),
            None => {
                trace!(event, "no subscribers");
                return 0;
            }
        };

        for callback in &snapshot {
            callback(payload);
        }
        snapshot.len()
    }

    /// Number of callbacks subscribed to `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.get(event).map_or(0, |list| list.len())
    }

    /// Removes every callback subscribed to `event`. Returns how many were removed.
    pub fn clear(&self, event: &str) -> usize {
        self.subscribers
            .remove(event)
            .map_or(0, |(_, list)| list.len())
    }
}
