//! Event kinds published on the bus and their payloads.
//!
//! Single source of truth for the names consumers subscribe to. Every case of
//! [`TransportEvent`] maps to exactly one [`EventKind`].

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_RECONNECTING: &str = "reconnecting";
pub const EVENT_RECONNECT_FAILED: &str = "reconnect_failed";
pub const EVENT_ERROR: &str = "error";

/// Key under which handlers are registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Message,
    Reconnecting,
    ReconnectFailed,
    Error,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => EVENT_CONNECTED,
            Self::Disconnected => EVENT_DISCONNECTED,
            Self::Message => EVENT_MESSAGE,
            Self::Reconnecting => EVENT_RECONNECTING,
            Self::ReconnectFailed => EVENT_RECONNECT_FAILED,
            Self::Error => EVENT_ERROR,
        }
    }

    pub const fn all() -> &'static [EventKind] {
        &[
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::Message,
            EventKind::Reconnecting,
            EventKind::ReconnectFailed,
            EventKind::Error,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// The transport signalled open.
    Connected,

    /// An open connection went away.
    Disconnected {
        /// Close code reported by the peer, if any.
        code: Option<u16>,
        reason: String,
    },

    /// A well-formed inbound frame.
    Message { payload: serde_json::Value },

    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, delay_ms: u64 },

    /// The reconnect budget is exhausted; nothing further is scheduled.
    ReconnectFailed { attempts: u32 },

    /// A connection attempt failed before the transport opened.
    Error { message: String },
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Message { .. } => EventKind::Message,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_event_maps_to_its_kind() {
        let events = [
            TransportEvent::Connected,
            TransportEvent::Disconnected {
                code: Some(1006),
                reason: "abnormal".to_string(),
            },
            TransportEvent::Message {
                payload: json!({"type": "chat"}),
            },
            TransportEvent::Reconnecting {
                attempt: 1,
                delay_ms: 3000,
            },
            TransportEvent::ReconnectFailed { attempts: 5 },
            TransportEvent::Error {
                message: "refused".to_string(),
            },
        ];
        let kinds: Vec<EventKind> = events.iter().map(TransportEvent::kind).collect();
        assert_eq!(kinds, EventKind::all());
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let value = serde_json::to_value(TransportEvent::ReconnectFailed { attempts: 5 }).unwrap();
        assert_eq!(value, json!({"event_type": "reconnect_failed", "attempts": 5}));
        assert_eq!(EventKind::ReconnectFailed.to_string(), "reconnect_failed");
    }
}
