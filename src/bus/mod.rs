//! Event bus connecting the transport core to its consumers.
//!
//! The event bus provides:
//! - Synchronous, ordered listener dispatch keyed by [`EventKind`]
//! - Per-handler panic isolation: one failing listener never affects the rest
//! - A broadcast tap for async consumers that prefer a stream of envelopes
//!
//! # Architecture
//!
//! Events flow from the connection manager → `EventBus` → listeners:
//! - `on`/`off`/`emit`: fire-and-forget dispatch on the emitter's task
//! - `subscribe`: `tokio::sync::broadcast` receiver of [`BusEnvelope`]s

mod event_bus;
mod event_types;

pub use event_bus::{handler, BusEnvelope, EventBus, Handler};
pub use event_types::{
    EventKind, TransportEvent, EVENT_CONNECTED, EVENT_DISCONNECTED, EVENT_ERROR, EVENT_MESSAGE,
    EVENT_RECONNECTING, EVENT_RECONNECT_FAILED,
};
