//! Explicit delivery-handler registration
//!
//! Handlers are registered once at connection setup and stay active for as long
//! as the returned [`Subscription`] is alive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::debug;

use crate::capture::CapturedEvent;

/// Callback invoked on the transport's reader task for every matching delivery
pub type DeliveryHandler = Arc<dyn Fn(&CapturedEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventFilter {
    Any,
    Named(String),
}

impl EventFilter {
    fn matches(&self, event: &str) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Named(name) => name == event,
        }
    }
}

struct Registration {
    id: u64,
    filter: EventFilter,
    handler: DeliveryHandler,
}

/// Fan-out of inbound deliveries to registered handlers
#[derive(Default)]
pub struct DeliveryRouter {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl DeliveryRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler for one event name
    pub fn on<F>(self: &Arc<Self>, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&CapturedEvent) + Send + Sync + 'static,
    {
        self.register(EventFilter::Named(event.into()), Arc::new(handler))
    }

    /// Register a handler for every delivery
    pub fn on_any<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&CapturedEvent) + Send + Sync + 'static,
    {
        self.register(EventFilter::Any, Arc::new(handler))
    }

    fn register(self: &Arc<Self>, filter: EventFilter, handler: DeliveryHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registrations = self.registrations.write().unwrap_or_else(PoisonError::into_inner);
        if !self.closed.load(Ordering::SeqCst) {
            registrations.push(Registration { id, filter, handler });
        }
        drop(registrations);

        Subscription {
            id,
            router: Arc::downgrade(self),
        }
    }

    fn unregister(&self, id: u64) {
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|registration| registration.id != id);
    }

    /// Hand a delivery to every matching handler, in registration order
    pub fn dispatch(&self, event: &CapturedEvent) {
        // Handlers run outside the lock so they may register or drop subscriptions
        let handlers: Vec<DeliveryHandler> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|registration| registration.filter.matches(&event.event))
            .map(|registration| Arc::clone(&registration.handler))
            .collect();

        if handlers.is_empty() {
            debug!("No handler for delivery '{}'", event.event);
        }

        for handler in handlers {
            handler(event);
        }
    }

    /// Drop every handler once the delivery source is gone. Handlers that own a
    /// [`CaptureSink`](crate::capture::CaptureSink) release it, so the matching
    /// queue reports `Closed` after its buffer drains.
    pub fn close(&self) {
        let mut registrations = self.registrations.write().unwrap_or_else(PoisonError::into_inner);
        self.closed.store(true, Ordering::SeqCst);
        let released = std::mem::take(&mut *registrations);
        drop(registrations);
        drop(released);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Disposable handle for a registered handler; dropping it unregisters the handler
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    router: Weak<DeliveryRouter>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unregister(self.id);
        }
    }
}
