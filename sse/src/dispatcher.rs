use dashmap::DashMap;
use events::EventType;
use log::*;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::message::Frame;

/// A callback invoked with the decoded payload of each matching event.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identity of one registered handler. Removal goes by identity, never by
/// comparing callbacks, so registering the same closure twice yields two
/// independent subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    handlers: DashMap<EventType, HashMap<HandlerId, Handler>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, event_type: EventType, id: HandlerId) -> bool {
        let Some(mut entry) = self.handlers.get_mut(&event_type) else {
            return false;
        };
        let removed = entry.remove(&id).is_some();

        // Clean up empty event type entries
        if entry.is_empty() {
            drop(entry); // Release lock before removal
            self.handlers.remove_if(&event_type, |_, set| set.is_empty());
        }

        removed
    }
}

/// Routes parsed events to the handlers registered for their type.
///
/// Cloning is cheap and clones share the same registry. A handler that
/// panics is isolated: the panic is logged and the remaining handlers, as
/// well as later events, are unaffected.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`.
    pub fn on<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .handlers
            .entry(event_type)
            .or_default()
            .insert(id, Arc::new(handler));

        trace!("Registered handler {:?} for {}", id, event_type);

        Subscription {
            event_type,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove exactly the handler behind `subscription`.
    pub fn off(&self, subscription: &Subscription) -> bool {
        self.registry
            .remove(subscription.event_type, subscription.id)
    }

    /// Remove every handler registered for `event_type`.
    pub fn off_all(&self, event_type: EventType) {
        self.registry.handlers.remove(&event_type);
    }

    pub fn clear(&self) {
        self.registry.handlers.clear();
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.registry
            .handlers
            .get(&event_type)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.registry.handlers.is_empty()
    }

    /// Parse a raw frame and dispatch it. Frames with a label outside the
    /// vocabulary are ignored; frames with malformed data are logged and
    /// dropped. Neither affects later frames.
    pub fn dispatch_frame(&self, frame: &Frame) {
        let Some(event_type) = frame.event_type() else {
            trace!("Ignoring frame with unhandled event type {}", frame.event_type);
            return;
        };

        match frame.payload() {
            Ok(payload) => {
                self.dispatch(event_type, &payload);
            }
            Err(e) => {
                warn!("Failed to parse SSE event data for {}: {}", event_type, e);
            }
        }
    }

    /// Invoke every handler registered for `event_type` with `payload`.
    /// Returns the number of handlers that completed without panicking.
    pub fn dispatch(&self, event_type: EventType, payload: &Value) -> usize {
        // Snapshot the handlers so none of the registry's locks are held while
        // user code runs; handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<(HandlerId, Handler)> = match self.registry.handlers.get(&event_type) {
            Some(set) => set.iter().map(|(id, h)| (*id, Arc::clone(h))).collect(),
            None => return 0,
        };

        let mut completed = 0;
        for (id, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    error!(
                        "Error in SSE handler {:?} for {}: {}",
                        id,
                        event_type,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        completed
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("event_types", &self.registry.handlers.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "handler panicked"
    }
}

/// Handle returned when registering a handler. Unsubscribing is idempotent and
/// outliving the dispatcher is harmless. Clones refer to the same handler.
#[derive(Clone)]
pub struct Subscription {
    event_type: EventType,
    id: HandlerId,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove this handler. Returns true only the first time, while the
    /// handler was still registered.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.event_type, self.id),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .and_then(|registry| {
                registry
                    .handlers
                    .get(&self.event_type)
                    .map(|set| set.contains_key(&self.id))
            })
            .unwrap_or(false)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .finish()
    }
}
