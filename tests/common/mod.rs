// tests/common/mod.rs
//! Common test utilities for courier integration tests.

#![allow(dead_code)]

pub mod mock_transport;

pub use mock_transport::{MockTransport, OpenBehavior};

use std::sync::Arc;
use std::time::Duration;

use courier::bus::{BusEnvelope, EventBus, TransportEvent};
use tokio::sync::broadcast;

/// Receive bus envelopes until `stop` matches one, returning every event seen.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<BusEnvelope>,
    stop: impl Fn(&TransportEvent) -> bool,
) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for bus event")
            .expect("bus closed");
        let done = stop(&envelope.event);
        events.push(envelope.event);
        if done {
            return events;
        }
    }
}

pub fn bus() -> Arc<EventBus> {
    Arc::new(EventBus::new())
}
