//! Connection and gateway configuration.
//!
//! Both structs deserialize with per-field defaults, so a partial JSON/env
//! document is enough. `from_env` reads `COURIER_*` variables after loading a
//! `.env` file if one exists.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 3000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TOKEN_QUERY_PARAM: &str = "token";
pub const DEFAULT_AUTH_HEADER: &str = "Authorization";
pub const DEFAULT_AUTH_SCHEME: &str = "Bearer";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("environment variable {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Endpoint the WebSocket transport dials. Unused in offline mode.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Simulate an always-succeeding connection without touching a transport.
    #[serde(default)]
    pub offline: bool,
    /// Treat a keepalive frame the transport refuses as an abnormal close.
    #[serde(default = "default_true")]
    pub reconnect_on_keepalive_failure: bool,
    #[serde(default = "default_keepalive_payload")]
    pub keepalive_payload: serde_json::Value,
    /// Query parameter carrying the access token on the WebSocket URL.
    #[serde(default = "default_token_query_param")]
    pub token_query_param: String,
}

fn default_true() -> bool {
    true
}
fn default_keepalive_interval_ms() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_MS
}
fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}
fn default_reconnect_base_delay_ms() -> u64 {
    DEFAULT_RECONNECT_BASE_DELAY_MS
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_keepalive_payload() -> serde_json::Value {
    serde_json::json!({ "type": "ping" })
}
fn default_token_query_param() -> String {
    DEFAULT_TOKEN_QUERY_PARAM.to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            keepalive_interval_ms: default_keepalive_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            offline: false,
            reconnect_on_keepalive_failure: true,
            keepalive_payload: default_keepalive_payload(),
            token_query_param: default_token_query_param(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Config for the simulated, always-connected mode.
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Default::default()
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay_ms = duration_ms(delay);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_reconnect_on_keepalive_failure(mut self, enabled: bool) -> Self {
        self.reconnect_on_keepalive_failure = enabled;
        self
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Load from `COURIER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self {
            url: env_string("COURIER_WS_URL"),
            ..Default::default()
        };
        if let Some(value) = env_parse("COURIER_KEEPALIVE_MS")? {
            config.keepalive_interval_ms = value;
        }
        if let Some(value) = env_parse("COURIER_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = value;
        }
        if let Some(value) = env_parse("COURIER_RECONNECT_BASE_MS")? {
            config.reconnect_base_delay_ms = value;
        }
        if let Some(value) = env_parse("COURIER_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = value;
        }
        if let Some(value) = env_parse("COURIER_OFFLINE")? {
            config.offline = value;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.offline {
            let url = self.url.as_deref().map(str::trim).unwrap_or_default();
            if url.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "url",
                    reason: "required unless offline mode is enabled".to_string(),
                });
            }
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::Invalid {
                    field: "url",
                    reason: format!("expected a ws:// or wss:// URL, got '{url}'"),
                });
            }
        }
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "keepalive_interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "connect_timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL that relative request targets are joined onto.
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    /// Response statuses that mean the credential expired or was rejected.
    #[serde(default = "default_auth_failure_statuses")]
    pub auth_failure_statuses: Vec<u16>,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_auth_header() -> String {
    DEFAULT_AUTH_HEADER.to_string()
}
fn default_auth_scheme() -> String {
    DEFAULT_AUTH_SCHEME.to_string()
}
fn default_auth_failure_statuses() -> Vec<u16> {
    vec![401]
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout_ms: default_request_timeout_ms(),
            auth_header: default_auth_header(),
            auth_scheme: default_auth_scheme(),
            auth_failure_statuses: default_auth_failure_statuses(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_auth_failure_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.auth_failure_statuses = statuses;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn is_auth_failure(&self, status: u16) -> bool {
        self.auth_failure_statuses.contains(&status)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let base_url = env_string("COURIER_API_URL").ok_or(ConfigError::Env {
            var: "COURIER_API_URL",
            reason: "not set".to_string(),
        })?;
        let mut config = Self::new(base_url);
        if let Some(value) = env_parse("COURIER_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = value;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "base_url",
                reason: format!("expected an http:// or https:// URL, got '{base_url}'"),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.auth_header.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth_header",
                reason: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn env_string(var: &'static str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(var) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Env {
            var,
            reason: format!("cannot parse '{raw}': {e}"),
        }),
        None => Ok(None),
    }
}
