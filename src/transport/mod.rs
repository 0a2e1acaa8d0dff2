//! Duplex transport abstraction used by the connection manager.
//!
//! A transport only knows how to open one channel. Once open, the channel is a
//! pair of unbounded queues:
//! - `outbound`: frames the manager hands to the transport (never blocks)
//! - `inbound`: frames, errors and the close signal coming back
//!
//! Dropping the [`TransportLink`] is how the manager tears a channel down.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod websocket;

pub use websocket::WebSocketTransport;

// ============================================================================
// Frames and signals
// ============================================================================

/// A single unit handed to or received from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What an open channel reports back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// An inbound frame, in arrival order.
    Frame(Frame),
    /// The channel failed; no further signals follow.
    Error(String),
    /// The peer closed the channel; no further signals follow.
    Closed { code: Option<u16>, reason: String },
}

/// The manager's side of an open channel.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<TransportSignal>,
}

/// The transport's side of an open channel.
#[derive(Debug)]
pub struct TransportPeer {
    /// Frames the manager wants written.
    pub frames: mpsc::UnboundedReceiver<Frame>,
    /// Where the transport reports frames, errors and closure.
    pub signals: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportLink {
    /// Create both ends of a channel.
    pub fn channel() -> (TransportLink, TransportPeer) {
        let (outbound, frames) = mpsc::unbounded_channel();
        let (signals, inbound) = mpsc::unbounded_channel();
        (
            TransportLink { outbound, inbound },
            TransportPeer { frames, signals },
        )
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Transport closed")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn connection<E: fmt::Display>(err: E) -> Self {
        TransportError::Connection(err.to_string())
    }
}

// ============================================================================
// Transport trait
// ============================================================================

/// Something that can open a duplex channel.
///
/// `open` resolving successfully is the "open" signal: the connection manager
/// considers the connection established at that point. Implementations must be
/// cancel-safe, since a pending `open` is dropped when the connection timeout
/// fires or the manager disconnects.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<TransportLink, TransportError>;

    /// Short label used in logs.
    fn name(&self) -> &str {
        "transport"
    }
}
