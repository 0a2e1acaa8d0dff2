//! Resilient transport layer.
//!
//! This crate handles:
//! - A persistent duplex connection with reconnect, backoff and keepalive
//! - Authenticated one-shot requests with single-flight credential renewal
//! - An event bus that carries connection lifecycle and inbound messages
//!
//! # Architecture
//!
//! - `bus`: typed publish/subscribe used by everything else
//! - `connection`: connection manager state machine and message router
//! - `transport`: the duplex channel contract and its WebSocket implementation
//! - `gateway`: request gateway and renewal coordination
//! - `credentials`: credential source contract shared by both halves
//! - `config`: connection and gateway settings

pub mod bus;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod gateway;
pub mod transport;

use std::sync::Arc;

pub use bus::{EventBus, EventKind, TransportEvent};
pub use config::{ConfigError, ConnectionConfig, GatewayConfig};
pub use connection::{ConnectionManager, ConnectionState, MessageRouter};
pub use credentials::{Credential, CredentialError, CredentialSource, StaticCredentials};
pub use gateway::{Gateway, GatewayError, GatewayResponse, RequestOptions};
pub use transport::{Transport, TransportError, WebSocketTransport};

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

const DEFAULT_LOG_FILTER: &str = "courier=debug,info";

/// Install the global fmt subscriber. `RUST_LOG` overrides the default filter.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ---------------------------------------------------------------------------
// Composition root
// ---------------------------------------------------------------------------

/// Why a [`Courier`] could not be assembled.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("connection config: {0}")]
    Connection(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// One bus, one connection and one gateway sharing a credential source.
#[derive(Clone)]
pub struct Courier {
    bus: Arc<EventBus>,
    connection: ConnectionManager,
    gateway: Gateway,
    credentials: Arc<dyn CredentialSource>,
}

impl Courier {
    /// Wire up a WebSocket connection (or an offline one) and a gateway.
    pub fn new(
        connection_config: ConnectionConfig,
        gateway_config: GatewayConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, CourierError> {
        connection_config.validate()?;
        let bus = Arc::new(EventBus::new());

        let connection = match connection_config.url.clone() {
            Some(url) if !connection_config.offline => {
                let transport = WebSocketTransport::new(url).with_credentials(
                    credentials.clone(),
                    connection_config.token_query_param.clone(),
                );
                ConnectionManager::new(connection_config, Arc::new(transport), bus.clone())
            }
            _ => ConnectionManager::offline(connection_config, bus.clone()),
        };

        Self::with_connection(connection, gateway_config, credentials)
    }

    /// Use an already built connection manager, sharing its bus.
    pub fn with_connection(
        connection: ConnectionManager,
        gateway_config: GatewayConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, CourierError> {
        let gateway = Gateway::new(gateway_config, credentials.clone())?;
        Ok(Self {
            bus: connection.bus().clone(),
            connection,
            gateway,
            credentials,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialSource> {
        &self.credentials
    }

    /// Attach a message router to this courier's bus.
    pub fn router(&self) -> MessageRouter {
        MessageRouter::attach(self.bus.clone())
    }
}
