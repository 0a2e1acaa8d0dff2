//! Dispatch of inbound messages by their `type` field.
//!
//! The connection manager publishes every inbound payload as one generic
//! `message` event. Consumers that speak a typed protocol register per-type
//! routes here instead of each matching on the payload themselves.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

use crate::bus::{handler, EventBus, EventKind, Handler, TransportEvent};

/// Field of the payload that selects a route.
pub const ROUTE_FIELD: &str = "type";

pub type RouteHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Routes {
    by_type: HashMap<String, Vec<RouteHandler>>,
    fallback: Option<RouteHandler>,
}

impl Routes {
    fn resolve(&self, payload: &Value) -> Vec<RouteHandler> {
        let matched = payload
            .get(ROUTE_FIELD)
            .and_then(Value::as_str)
            .and_then(|kind| self.by_type.get(kind));
        match (matched, &self.fallback) {
            (Some(handlers), _) => handlers.clone(),
            (None, Some(fallback)) => vec![fallback.clone()],
            (None, None) => Vec::new(),
        }
    }
}

/// A single `message` listener fanning out to per-type routes.
pub struct MessageRouter {
    bus: Arc<EventBus>,
    routes: Arc<RwLock<Routes>>,
    listener: Handler,
}

impl MessageRouter {
    /// Attach a router to `bus`. Routes can be added before or after.
    pub fn attach(bus: Arc<EventBus>) -> Self {
        let routes: Arc<RwLock<Routes>> = Arc::default();
        let dispatch = routes.clone();
        let listener = handler(move |event| {
            let TransportEvent::Message { payload } = event else {
                return;
            };
            // Snapshot so a route may add routes without deadlocking.
            let handlers = dispatch.read().resolve(payload);
            if handlers.is_empty() {
                trace!("no route for inbound message");
            }
            for route in handlers {
                route(payload);
            }
        });
        bus.on(EventKind::Message, listener.clone());
        Self {
            bus,
            routes,
            listener,
        }
    }

    /// Call `f` for every message whose `type` equals `message_type`.
    pub fn route<F>(&self, message_type: impl Into<String>, f: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.routes
            .write()
            .by_type
            .entry(message_type.into())
            .or_default()
            .push(Arc::new(f));
        self
    }

    /// Call `f` for messages no route matched, including untyped ones.
    pub fn fallback<F>(&self, f: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.routes.write().fallback = Some(Arc::new(f));
        self
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().by_type.values().map(Vec::len).sum()
    }

    /// Remove the router's listener from the bus.
    pub fn detach(self) {
        self.bus.off(EventKind::Message, &self.listener);
    }
}
