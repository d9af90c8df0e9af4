//! Subscription registry
//!
//! Maps an event type to the handlers interested in it. The registry is built
//! mutably during startup and then frozen behind an `Arc` for the dispatcher,
//! so lookups on the delivery path take no lock.

use crate::handler::{EventHandler, IntegrationEventHandler, Typed};
use event_bus::IntegrationEvent;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`
    ///
    /// Returns `false` when a handler with the same name is already registered
    /// for that type; the registry is left unchanged in that case.
    pub fn subscribe(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> bool {
        let event_type = event_type.into();
        let entries = self.handlers.entry(event_type.clone()).or_default();

        if entries.iter().any(|h| h.name() == handler.name()) {
            tracing::debug!(
                event_type = %event_type,
                handler = handler.name(),
                "Handler already subscribed, ignoring"
            );
            return false;
        }

        tracing::info!(event_type = %event_type, handler = handler.name(), "Subscribed handler");
        entries.push(handler);
        true
    }

    /// Register a typed handler under `T::EVENT_TYPE`
    pub fn subscribe_typed<T, H>(&mut self, handler: H) -> bool
    where
        T: IntegrationEvent,
        H: IntegrationEventHandler<T> + 'static,
    {
        self.subscribe(T::EVENT_TYPE, Arc::new(Typed::<T, H>::new(handler)))
    }

    /// Remove the handler named `handler_name` from `event_type`
    ///
    /// Deliveries already handed to the handler are not affected.
    pub fn unsubscribe(&mut self, event_type: &str, handler_name: &str) -> bool {
        let Some(entries) = self.handlers.get_mut(event_type) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|h| h.name() != handler_name);
        let removed = entries.len() != before;

        if entries.is_empty() {
            self.handlers.remove(event_type);
        }
        if removed {
            tracing::info!(event_type, handler = handler_name, "Unsubscribed handler");
        }
        removed
    }

    /// Handlers for `event_type` in registration order (empty when unknown)
    pub fn resolve(&self, event_type: &str) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (event_type, handlers) in &self.handlers {
            let names: Vec<&str> = handlers.iter().map(|h| h.name()).collect();
            map.entry(event_type, &names);
        }
        map.finish()
    }
}
