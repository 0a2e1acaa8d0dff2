// tests/common/mock_transport.rs
//! Mock transport for connection manager integration testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use courier::transport::{Transport, TransportError, TransportLink, TransportPeer};

/// What the next `open` call does.
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    Accept,
    Refuse(String),
    /// Never resolves; only a timeout or disconnect ends the attempt.
    Stall,
}

/// A transport whose opens follow a script, keeping the peer end of every
/// accepted channel for the test to drive.
pub struct MockTransport {
    script: Mutex<VecDeque<OpenBehavior>>,
    default_behavior: OpenBehavior,
    open_count: AtomicUsize,
    peers: Mutex<VecDeque<TransportPeer>>,
}

impl MockTransport {
    /// Create a mock that accepts every open not otherwise scripted.
    pub fn new() -> Self {
        Self::with_default(OpenBehavior::Accept)
    }

    pub fn with_default(default_behavior: OpenBehavior) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_behavior,
            open_count: AtomicUsize::new(0),
            peers: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a behavior for the next unscripted open.
    pub async fn push_behavior(&self, behavior: OpenBehavior) {
        self.script.lock().await.push_back(behavior);
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// The peer side of the oldest accepted channel not yet taken.
    pub async fn next_peer(&self) -> Option<TransportPeer> {
        self.peers.lock().await.pop_front()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.clone());

        match behavior {
            OpenBehavior::Accept => {
                let (link, peer) = TransportLink::channel();
                self.peers.lock().await.push_back(peer);
                Ok(link)
            }
            OpenBehavior::Refuse(message) => Err(TransportError::Connection(message)),
            OpenBehavior::Stall => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
