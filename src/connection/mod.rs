//! Persistent connection management with automatic reconnection.
//!
//! This module provides:
//! - A lifecycle state machine around one logical duplex connection
//! - Connection-establishment timeout, keepalive, and exponential backoff
//! - Republishing of inbound messages and lifecycle events on the [`EventBus`]
//! - An offline mode that simulates an always-available connection
//!
//! # Timers
//!
//! Each timer purpose owns one `Option<JoinHandle<()>>` slot. Cancelling takes
//! the handle out of its slot and aborts it. Every spawned task also carries
//! the epoch it was armed for; `disconnect()` and every new attempt bump the
//! epoch, so a task that was already past its await point when cancelled finds
//! a stale epoch and does nothing.
//!
//! # Locking
//!
//! All state sits behind one mutex that is never held across an `.await` or
//! while listeners run. Transitions collect their events under the lock and
//! emit them after releasing it, so listeners may call back into the manager.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{EventBus, TransportEvent};
use crate::config::ConnectionConfig;
use crate::transport::{Frame, Transport, TransportError, TransportLink, TransportSignal};

pub mod router;
mod state;


pub use router::{MessageRouter, RouteHandler};
pub use state::{reconnect_delay, ConnectionState};

/// How long offline mode pretends the handshake takes.
pub const OFFLINE_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Close code reported when the client itself disconnects.
pub const CLIENT_CLOSE_CODE: u16 = 1000;

/// Shortest keepalive period actually scheduled.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Internal state
// ============================================================================

#[derive(Default)]
struct Tasks {
    /// The pending `Transport::open` (or the offline handshake delay).
    connect_attempt: Option<JoinHandle<()>>,
    connect_timeout: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Tasks {
    fn cancel_all(&mut self) {
        cancel(&mut self.connect_attempt);
        cancel(&mut self.connect_timeout);
        cancel(&mut self.keepalive);
        cancel(&mut self.reconnect);
        cancel(&mut self.reader);
    }
}

fn cancel(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

struct Core {
    state: ConnectionState,
    reconnect_attempt: u32,
    should_reconnect: bool,
    epoch: u64,
    /// The transport handle. `None` whenever not connected.
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    tasks: Tasks,
}

struct Inner {
    config: ConnectionConfig,
    /// `None` means offline mode.
    transport: Option<Arc<dyn Transport>>,
    bus: Arc<EventBus>,
    keepalive_frame: String,
    core: Mutex<Core>,
}

// ============================================================================
// Public handle
// ============================================================================

/// Owns one logical duplex connection. Cheap to clone; clones share state.
///
/// None of the public operations block or return errors: failures become
/// events on the bus or `false` from [`ConnectionManager::send`].
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Manage a connection over `transport`. `config.offline` still wins.
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>, bus: Arc<EventBus>) -> Self {
        let transport = if config.offline { None } else { Some(transport) };
        Self::build(config, transport, bus)
    }

    /// Manage a simulated connection that never touches a transport.
    pub fn offline(config: ConnectionConfig, bus: Arc<EventBus>) -> Self {
        let config = ConnectionConfig {
            offline: true,
            ..config
        };
        Self::build(config, None, bus)
    }

    fn build(
        config: ConnectionConfig,
        transport: Option<Arc<dyn Transport>>,
        bus: Arc<EventBus>,
    ) -> Self {
        let keepalive_frame = config.keepalive_payload.to_string();
        if config.keepalive_interval_ms == 0 {
            error!(
                min_ms = MIN_KEEPALIVE_INTERVAL.as_millis() as u64,
                "keepalive_interval_ms is 0; clamping to the minimum period"
            );
        }
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                bus,
                keepalive_frame,
                core: Mutex::new(Core {
                    state: ConnectionState::Disconnected,
                    reconnect_attempt: 0,
                    should_reconnect: false,
                    epoch: 0,
                    outbound: None,
                    tasks: Tasks::default(),
                }),
            }),
        }
    }

    /// Start connecting. A no-op while connecting or connected.
    ///
    /// From any other state this is a fresh start: the attempt counter goes
    /// back to zero, automatic reconnection is re-enabled and any pending
    /// backoff timer is dropped in favour of connecting now.
    pub fn connect(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            error!("connect() called outside a tokio runtime; ignoring");
            return;
        }

        let events = {
            let mut core = self.inner.core.lock();
            if core.state.is_active() {
                debug!(state = %core.state, "connect ignored: attempt already underway");
                return;
            }
            core.reconnect_attempt = 0;
            core.should_reconnect = true;
            cancel(&mut core.tasks.reconnect);
            self.inner.begin_attempt(&mut core)
        };
        self.inner.dispatch(events);
    }

    /// Close the connection for good.
    ///
    /// Cancels the connect attempt, its timeout, the keepalive and any pending
    /// backoff before dropping the transport handle. Only a later manual
    /// [`connect`](Self::connect) brings the connection back.
    pub fn disconnect(&self) {
        let events = {
            let mut core = self.inner.core.lock();
            let was_open = core.state == ConnectionState::Connected;
            core.should_reconnect = false;
            core.epoch += 1;
            core.tasks.cancel_all();
            core.outbound = None;
            let previous = core.state;
            core.state = ConnectionState::Closed;
            info!(previous = %previous, "connection closed by client");

            if was_open {
                vec![TransportEvent::Disconnected {
                    code: Some(CLIENT_CLOSE_CODE),
                    reason: "client disconnect".to_string(),
                }]
            } else {
                Vec::new()
            }
        };
        self.inner.dispatch(events);
    }

    /// Serialize `payload` as JSON and hand it to the transport.
    ///
    /// Returns false when not connected, when serialization fails, or when the
    /// transport no longer accepts frames. Offline mode always reports success.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        if self.inner.is_offline() {
            return true;
        }
        match serde_json::to_string(payload) {
            Ok(text) => self.send_frame(Frame::Text(text)),
            Err(e) => {
                warn!("failed to serialize outbound payload: {e}");
                false
            }
        }
    }

    /// Hand a raw frame to the transport.
    pub fn send_frame(&self, frame: Frame) -> bool {
        if self.inner.is_offline() {
            return true;
        }
        let core = self.inner.core.lock();
        if core.state != ConnectionState::Connected {
            debug!(state = %core.state, "send dropped: not connected");
            return false;
        }
        match core.outbound.as_ref() {
            Some(outbound) => {
                trace!(bytes = frame.len(), "frame handed to transport");
                outbound.send(frame).is_ok()
            }
            None => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful open or manual
    /// `connect()`.
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.core.lock().reconnect_attempt
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

// ============================================================================
// Transitions
// ============================================================================

impl Inner {
    fn is_offline(&self) -> bool {
        self.transport.is_none()
    }

    fn dispatch(&self, events: Vec<TransportEvent>) {
        for event in events {
            self.bus.emit(event);
        }
    }

    /// Enter `Connecting` and start one open attempt under a fresh epoch.
    fn begin_attempt(self: &Arc<Self>, core: &mut Core) -> Vec<TransportEvent> {
        core.epoch += 1;
        let epoch = core.epoch;
        core.state = ConnectionState::Connecting;
        cancel(&mut core.tasks.connect_attempt);
        cancel(&mut core.tasks.connect_timeout);

        let Some(transport) = self.transport.clone() else {
            debug!("offline mode: simulating connection");
            core.tasks.connect_attempt = spawn_for(self, move |inner| async move {
                tokio::time::sleep(OFFLINE_CONNECT_DELAY).await;
                if let Some(inner) = inner.upgrade() {
                    inner.on_offline_open(epoch);
                }
            });
            return Vec::new();
        };

        info!(
            transport = transport.name(),
            attempt = core.reconnect_attempt,
            "connecting"
        );
        core.tasks.connect_attempt = spawn_for(self, move |inner| async move {
            let result = transport.open().await;
            if let Some(inner) = inner.upgrade() {
                inner.on_open_result(epoch, result);
            }
        });

        let timeout = self.config.connect_timeout();
        core.tasks.connect_timeout = spawn_for(self, move |inner| async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.on_connect_timeout(epoch);
            }
        });
        Vec::new()
    }

    fn on_offline_open(self: &Arc<Self>, epoch: u64) {
        let events = {
            let mut core = self.core.lock();
            if core.epoch != epoch || core.state != ConnectionState::Connecting {
                return;
            }
            core.tasks.connect_attempt.take();
            core.state = ConnectionState::Connected;
            core.reconnect_attempt = 0;
            info!("offline connection established");
            vec![TransportEvent::Connected]
        };
        self.dispatch(events);
    }

    fn on_open_result(self: &Arc<Self>, epoch: u64, result: Result<TransportLink, TransportError>) {
        let events = {
            let mut core = self.core.lock();
            if core.epoch != epoch || core.state != ConnectionState::Connecting {
                // The link, if any, is dropped here, which closes it.
                debug!("discarding stale connection attempt");
                return;
            }
            core.tasks.connect_attempt.take();
            cancel(&mut core.tasks.connect_timeout);

            match result {
                Ok(link) => self.on_open(&mut core, link),
                Err(e) => {
                    warn!(attempt = core.reconnect_attempt, "connection attempt failed: {e}");
                    let mut events = vec![TransportEvent::Error {
                        message: e.to_string(),
                    }];
                    events.extend(self.schedule_reconnect(&mut core));
                    events
                }
            }
        };
        self.dispatch(events);
    }

    fn on_open(self: &Arc<Self>, core: &mut Core, link: TransportLink) -> Vec<TransportEvent> {
        let TransportLink { outbound, inbound } = link;
        let epoch = core.epoch;
        core.outbound = Some(outbound);
        core.state = ConnectionState::Connected;
        core.reconnect_attempt = 0;

        core.tasks.reader = spawn_for(self, move |inner| read_loop(inner, epoch, inbound));

        // `interval_at` panics on a zero period.
        let interval = self.config.keepalive_interval().max(MIN_KEEPALIVE_INTERVAL);
        core.tasks.keepalive = spawn_for(self, move |inner| async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if !inner.on_keepalive_tick(epoch) {
                    return;
                }
            }
        });

        info!("connected");
        vec![TransportEvent::Connected]
    }

    fn on_connect_timeout(self: &Arc<Self>, epoch: u64) {
        let events = {
            let mut core = self.core.lock();
            if core.epoch != epoch || core.state != ConnectionState::Connecting {
                return;
            }
            core.tasks.connect_timeout.take();
            cancel(&mut core.tasks.connect_attempt);

            let timeout = self.config.connect_timeout();
            warn!(timeout_ms = self.config.connect_timeout_ms, "connection attempt timed out");
            let mut events = vec![TransportEvent::Error {
                message: TransportError::Timeout(timeout).to_string(),
            }];
            events.extend(self.schedule_reconnect(&mut core));
            events
        };
        self.dispatch(events);
    }

    fn on_frame(&self, epoch: u64, frame: Frame) {
        {
            let core = self.core.lock();
            if core.epoch != epoch || core.state != ConnectionState::Connected {
                return;
            }
        }

        let parsed = match &frame {
            Frame::Text(text) => serde_json::from_str::<serde_json::Value>(text),
            Frame::Binary(bytes) => serde_json::from_slice::<serde_json::Value>(bytes),
        };
        match parsed {
            Ok(payload) => self.bus.emit(TransportEvent::Message { payload }),
            Err(e) => warn!(bytes = frame.len(), "dropping malformed frame: {e}"),
        }
    }

    /// The transport went away without `disconnect()` being called.
    fn on_transport_closed(self: &Arc<Self>, epoch: u64, code: Option<u16>, reason: String) {
        let events = {
            let mut core = self.core.lock();
            if core.epoch != epoch || core.state != ConnectionState::Connected {
                return;
            }
            core.tasks.reader.take();
            cancel(&mut core.tasks.keepalive);
            core.outbound = None;
            warn!(code = ?code, reason = %reason, "connection lost");
            self.after_abnormal_close(&mut core, code, reason)
        };
        self.dispatch(events);
    }

    /// Returns whether the keepalive loop should keep running.
    fn on_keepalive_tick(self: &Arc<Self>, epoch: u64) -> bool {
        let events = {
            let mut core = self.core.lock();
            if core.epoch != epoch || core.state != ConnectionState::Connected {
                return false;
            }
            let sent = core
                .outbound
                .as_ref()
                .is_some_and(|tx| tx.send(Frame::Text(self.keepalive_frame.clone())).is_ok());
            if sent {
                trace!("keepalive sent");
                return true;
            }

            warn!("keepalive frame rejected by transport");
            if !self.config.reconnect_on_keepalive_failure {
                return true;
            }
            core.tasks.keepalive.take();
            cancel(&mut core.tasks.reader);
            core.outbound = None;
            self.after_abnormal_close(&mut core, None, "keepalive failed".to_string())
        };
        self.dispatch(events);
        false
    }

    fn after_abnormal_close(
        self: &Arc<Self>,
        core: &mut Core,
        code: Option<u16>,
        reason: String,
    ) -> Vec<TransportEvent> {
        let mut events = vec![TransportEvent::Disconnected { code, reason }];
        if core.should_reconnect {
            events.extend(self.schedule_reconnect(core));
        } else {
            core.state = ConnectionState::Disconnected;
        }
        events
    }

    /// Arm the backoff timer for the next attempt, or give up.
    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core) -> Vec<TransportEvent> {
        let max = self.config.max_reconnect_attempts;
        if core.reconnect_attempt >= max {
            core.state = ConnectionState::ReconnectFailed;
            error!(attempts = core.reconnect_attempt, "reconnect attempts exhausted");
            return vec![TransportEvent::ReconnectFailed {
                attempts: core.reconnect_attempt,
            }];
        }

        core.reconnect_attempt += 1;
        let attempt = core.reconnect_attempt;
        let delay = reconnect_delay(self.config.reconnect_base_delay(), attempt);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        core.state = ConnectionState::Reconnecting;

        let epoch = core.epoch;
        cancel(&mut core.tasks.reconnect);
        core.tasks.reconnect = spawn_for(self, move |inner| async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.on_reconnect_timer(epoch);
            }
        });

        info!(attempt, max, delay_ms, "reconnect scheduled");
        vec![TransportEvent::Reconnecting { attempt, delay_ms }]
    }

    fn on_reconnect_timer(self: &Arc<Self>, epoch: u64) {
        let events = {
            let mut core = self.core.lock();
            if core.epoch != epoch
                || core.state != ConnectionState::Reconnecting
                || !core.should_reconnect
            {
                return;
            }
            core.tasks.reconnect.take();
            self.begin_attempt(&mut core)
        };
        self.dispatch(events);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core.get_mut().tasks.cancel_all();
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Spawn a task holding only a weak reference to the manager, so dropping the
/// last handle stops everything.
fn spawn_for<F, Fut>(inner: &Arc<Inner>, task: F) -> Option<JoinHandle<()>>
where
    F: FnOnce(Weak<Inner>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(inner);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(task(weak))),
        Err(_) => {
            error!("no tokio runtime available; connection task not started");
            None
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportSignal>,
) {
    while let Some(signal) = inbound.recv().await {
        let Some(manager) = inner.upgrade() else {
            return;
        };
        match signal {
            TransportSignal::Frame(frame) => manager.on_frame(epoch, frame),
            TransportSignal::Error(message) => {
                manager.on_transport_closed(epoch, None, message);
                return;
            }
            TransportSignal::Closed { code, reason } => {
                manager.on_transport_closed(epoch, code, reason);
                return;
            }
        }
    }
    if let Some(manager) = inner.upgrade() {
        manager.on_transport_closed(epoch, None, "transport channel dropped".to_string());
    }
}
