use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::event_types::{EventKind, TransportEvent};

const BUS_CAPACITY: usize = 1024;

/// A registered listener. Identity is the `Arc` allocation: the same handle
/// registered twice is two registrations.
pub type Handler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&TransportEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Event as seen by async subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub id: String,
    pub seq: i64,
    pub event: TransportEvent,
    pub created_at: String,
}

pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Handler>>>,
    tx: broadcast::Sender<BusEnvelope>,
    seq: AtomicI64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            listeners: Mutex::new(HashMap::new()),
            tx,
            seq: AtomicI64::new(0),
        }
    }

    /// Register `handler` for `kind`. Handlers run in registration order.
    pub fn on(&self, kind: EventKind, handler: Handler) {
        self.listeners.lock().entry(kind).or_default().push(handler);
    }

    /// Remove one registration of `handler` for `kind`.
    ///
    /// Returns false if the handle was not registered.
    pub fn off(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(registered) = listeners.get_mut(&kind) else {
            return false;
        };
        let Some(index) = registered.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        registered.remove(index);
        if registered.is_empty() {
            listeners.remove(&kind);
        }
        true
    }

    /// Invoke every handler registered for the event's kind, then publish the
    /// event to async subscribers.
    ///
    /// The handler list is snapshotted before the first call, so handlers may
    /// register or remove listeners without affecting this emission.
    pub fn emit(&self, event: TransportEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .listeners
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for (index, handler) in handlers.iter().enumerate() {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                tracing::error!(
                    event = %kind,
                    handler = index,
                    "event handler panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }

        self.publish(event);
    }

    /// Drop the handlers for one kind, or for every kind when `kind` is `None`.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let mut listeners = self.listeners.lock();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Get a new receiver for this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
        self.tx.subscribe()
    }

    fn publish(&self, event: TransportEvent) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let envelope = BusEnvelope {
            id: Uuid::new_v4().to_string(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            event,
            created_at: Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.tx.send(envelope) {
            tracing::trace!("event bus publish dropped: {e}");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
