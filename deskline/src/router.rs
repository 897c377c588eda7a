//! Fan-out of inbound frames to registered handlers.
//!
//! Handlers are registered per [`EventType`] and invoked in registration
//! order. Each handler runs in its own error boundary: an `Err` return or a
//! panic is logged and counted, and the remaining handlers still run.
//!
//! Two ways to unregister exist. [`DeliveryRouter::off`] clears every
//! handler of an event type. [`DeliveryRouter::unsubscribe`] removes only
//! the handler behind one [`Subscription`], which lets several surfaces
//! observe the same event type side by side.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use deskline_proto::frame::{self, EventType, InboundFrame};
use parking_lot::RwLock;

/// Error a handler may return; it is logged and does not stop dispatch.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A registered frame handler.
pub type Handler = Arc<dyn Fn(&InboundFrame) -> Result<(), HandlerError> + Send + Sync>;

/// Handle to one registered handler.
#[must_use = "dropping a Subscription leaves the handler registered with no way to remove it"]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: EventType,
    id: u64,
}

impl Subscription {
    /// Event type the handler is registered for.
    #[must_use]
    pub const fn event(&self) -> &EventType {
        &self.event
    }
}

/// Outcome of dispatching one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Event type of the frame.
    pub event: EventType,
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Registry of inbound frame handlers, shared process-wide.
#[derive(Default)]
pub struct DeliveryRouter {
    handlers: RwLock<HashMap<EventType, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for DeliveryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(event, list)| (event.as_str(), list.len()))
            .collect();
        f.debug_struct("DeliveryRouter")
            .field("handlers", &counts)
            .finish_non_exhaustive()
    }
}

impl DeliveryRouter {
    /// Creates a router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event`, after any existing handlers.
    pub fn on<F>(&self, event: EventType, handler: F) -> Subscription
    where
        F: Fn(&InboundFrame) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        tracing::debug!(event = %event, id, "handler registered");
        Subscription { event, id }
    }

    /// Removes every handler registered for `event`.
    ///
    /// Returns the number of handlers removed.
    pub fn off(&self, event: &EventType) -> usize {
        let removed = self
            .handlers
            .write()
            .remove(event)
            .map_or(0, |list| list.len());
        tracing::debug!(event = %event, removed, "handlers cleared");
        removed
    }

    /// Removes exactly the handler behind `subscription`.
    ///
    /// Returns `false` if it was already removed (for example by
    /// [`off`](Self::off)).
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&subscription.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&subscription.event);
        }
        removed
    }

    /// Number of handlers registered for `event`.
    pub fn listener_count(&self, event: &EventType) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }

    /// Parses a raw text frame and dispatches it.
    ///
    /// A frame that fails to parse is logged and dropped; `None` is
    /// returned in that case.
    pub fn dispatch(&self, text: &str) -> Option<DispatchReport> {
        match frame::decode_inbound(text) {
            Ok(frame) => Some(self.dispatch_frame(&frame)),
            Err(e) => {
                tracing::warn!(error = %e, "malformed inbound frame, dropping");
                None
            }
        }
    }

    /// Invokes every handler registered for the frame's event type.
    ///
    /// The handler list is copied before the first call, so handlers may
    /// register or unregister handlers without deadlocking; such changes
    /// take effect from the next frame.
    pub fn dispatch_frame(&self, frame: &InboundFrame) -> DispatchReport {
        let event = frame.event_type();
        let snapshot: Vec<Handler> = self
            .handlers
            .read()
            .get(&event)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut failed = 0;
        for handler in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(event = %event, error = %e, "handler failed");
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(event = %event, "handler panicked");
                }
            }
        }

        if snapshot.is_empty() {
            tracing::trace!(event = %event, "no handlers for frame");
        }
        DispatchReport {
            event,
            invoked: snapshot.len(),
            failed,
        }
    }
}
