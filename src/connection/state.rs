//! Lifecycle states and the reconnect backoff schedule.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected, or a connection went away with reconnection off.
    Disconnected,
    /// A transport open is in progress.
    Connecting,
    /// The transport is open.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// The reconnect budget ran out. A manual `connect()` starts over.
    ReconnectFailed,
    /// Explicitly disconnected. Nothing happens until a manual `connect()`.
    Closed,
}

impl ConnectionState {
    /// True while an attempt is underway or established.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::ReconnectFailed => write!(f, "reconnect_failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base × 2^(attempt-1)`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}
