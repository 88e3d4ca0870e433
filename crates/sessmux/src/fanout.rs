//! Subscriber registries and event fan-out
//!
//! Both producers publish through an [`EventFanout`]: two insertion-order
//! registries of weak handler references, one per event kind. Handlers are
//! never invoked under a registry lock — a handler is free to subscribe or
//! unsubscribe (itself or others) from inside `handle_event`.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::trace;
use uuid::Uuid;

use crate::event::{ClosedEvent, ClosedEventHandler, ReadEvent, ReadEventHandler};

/// Insertion-order registry of weak handler references keyed by handler id.
///
/// Entries whose handler has been dropped are pruned lazily while
/// collecting for fan-out.
pub(crate) struct HandlerRegistry<H: ?Sized> {
    entries: Mutex<Vec<(Uuid, Weak<H>)>>,
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler` under `id`. Returns `false` when the id is
    /// already subscribed.
    pub(crate) fn subscribe(&self, id: Uuid, handler: Weak<H>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if entries.iter().any(|(existing, _)| *existing == id) {
            return false;
        }

        entries.push((id, handler));

        true
    }

    /// Remove the subscription under `id`. Returns `false` when unknown.
    pub(crate) fn unsubscribe(&self, id: Uuid) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);

        entries.len() != before
    }

    /// Snapshot the live handlers, pruning dead entries while the lock is
    /// held. Upgrading happens in the caller, outside the lock.
    pub(crate) fn collect(&self) -> Vec<Weak<H>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        entries.retain(|(_, handler)| handler.strong_count() > 0);

        entries.iter().map(|(_, handler)| handler.clone()).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// The producer-side publication point for read and closed batches.
pub(crate) struct EventFanout {
    name: String,
    read_handlers: HandlerRegistry<dyn ReadEventHandler>,
    closed_handlers: HandlerRegistry<dyn ClosedEventHandler>,
}

impl EventFanout {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_handlers: HandlerRegistry::new(),
            closed_handlers: HandlerRegistry::new(),
        }
    }

    pub(crate) fn subscribe_to_read_events(&self, handler: Weak<dyn ReadEventHandler>) -> bool {
        let Some(strong) = handler.upgrade() else {
            return false;
        };

        self.read_handlers.subscribe(strong.handler_id(), handler)
    }

    pub(crate) fn unsubscribe_from_read_events(&self, id: Uuid) -> bool {
        self.read_handlers.unsubscribe(id)
    }

    pub(crate) fn subscribe_to_closed_events(&self, handler: Weak<dyn ClosedEventHandler>) -> bool {
        let Some(strong) = handler.upgrade() else {
            return false;
        };

        self.closed_handlers.subscribe(strong.handler_id(), handler)
    }

    pub(crate) fn unsubscribe_from_closed_events(&self, id: Uuid) -> bool {
        self.closed_handlers.unsubscribe(id)
    }

    /// Deliver a read batch to every live subscriber, outside the
    /// registry lock.
    pub(crate) fn raise_read_event(&self, event: ReadEvent) {
        let handlers = self.read_handlers.collect();

        trace!(
            producer = %self.name,
            sessions = event.sessions().len(),
            handlers = handlers.len(),
            "raising read event"
        );

        for handler in handlers {
            if let Some(handler) = handler.upgrade() {
                handler.handle_event(&event);
            }
        }
    }

    /// Deliver a closed batch to every live subscriber, outside the
    /// registry lock.
    pub(crate) fn raise_closed_event(&self, event: ClosedEvent) {
        let handlers = self.closed_handlers.collect();

        trace!(
            producer = %self.name,
            sessions = event.sessions().len(),
            handlers = handlers.len(),
            "raising closed event"
        );

        for handler in handlers {
            if let Some(handler) = handler.upgrade() {
                handler.handle_event(&event);
            }
        }
    }
}
