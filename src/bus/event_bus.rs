//! Publish/subscribe event bus

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::domain::events::{DomainEvent, EventKind};
use crate::{Error, Result};

/// Event handler: observes an event, may fail without affecting delivery
pub type EventHandlerFn = Arc<dyn Fn(&DomainEvent) -> Result<()> + Send + Sync>;

/// Error handler: observes a failed (handler, event) pair
pub type ErrorHandlerFn = Arc<dyn Fn(&Error, &DomainEvent) + Send + Sync>;

/// Thread-safe event bus.
///
/// Two subscription modes: per-event-kind and firehose. Delivery is
/// synchronous within the publishing thread, sequential in subscription
/// order (kind-scoped handlers first, then firehose). A failing handler is
/// logged and routed to the error-handler chain; it never aborts delivery
/// to the remaining handlers.
///
/// The subscription lock is held only for subscribe/unsubscribe; publishing
/// snapshots the handler list and runs outside the lock.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandlerFn>>>,
    firehose: RwLock<Vec<EventHandlerFn>>,
    error_handlers: RwLock<Vec<ErrorHandlerFn>>,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind
    pub fn subscribe(&self, kind: EventKind, handler: EventHandlerFn) {
        self.handlers.write().entry(kind).or_default().push(handler);
        debug!(?kind, "event handler subscribed");
    }

    /// Subscribe to every event
    pub fn subscribe_all(&self, handler: EventHandlerFn) {
        self.firehose.write().push(handler);
        debug!("firehose handler subscribed");
    }

    /// Register a handler for errors raised during event handling
    pub fn on_error(&self, handler: ErrorHandlerFn) {
        self.error_handlers.write().push(handler);
    }

    /// Publish an event to all matching handlers
    pub fn publish(&self, event: &DomainEvent) {
        let mut handlers: Vec<EventHandlerFn> = self
            .handlers
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        handlers.extend(self.firehose.read().iter().cloned());

        for handler in handlers {
            if let Err(e) = handler(event) {
                error!(
                    event_kind = ?event.kind(),
                    error = %e,
                    "event handler failed"
                );
                let error_handlers = self.error_handlers.read().clone();
                for error_handler in error_handlers {
                    error_handler(&e, event);
                }
            }
        }
    }

    /// Drop all subscriptions (mainly for tests)
    pub fn clear(&self) {
        self.handlers.write().clear();
        self.firehose.write().clear();
        self.error_handlers.write().clear();
    }
}
