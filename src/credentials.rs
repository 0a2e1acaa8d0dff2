//! Credential source contract shared by the connection manager and gateway.
//!
//! The core never persists credentials. It reads the current one at the
//! moment it needs it, asks the source to renew when a call is rejected, and
//! reports the outcome back.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;

/// An access token. `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for attaching to a request.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("credential renewal rejected: {0}")]
    Rejected(String),
    #[error("credential source unavailable: {0}")]
    Unavailable(String),
}

/// Where the current access token lives.
///
/// `renew_credential` returning `Ok(None)` or `Err` both count as a failed
/// renewal.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn current_credential(&self) -> Option<Credential>;

    async fn renew_credential(&self) -> Result<Option<Credential>, CredentialError>;

    /// Called once per successful renewal, before waiters are released.
    fn on_credential_renewed(&self, credential: &Credential);

    /// Called when renewal failed and the session cannot continue.
    fn on_session_terminated(&self);
}

// ============================================================================
// Static credentials
// ============================================================================

/// A fixed token with no way to renew it.
///
/// Renewal always fails, so the first rejected call terminates the session
/// and clears the token.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    current: RwLock<Option<Credential>>,
}

impl StaticCredentials {
    pub fn new(token: Option<Credential>) -> Self {
        Self {
            current: RwLock::new(token),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    fn current_credential(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    async fn renew_credential(&self) -> Result<Option<Credential>, CredentialError> {
        Err(CredentialError::Unavailable(
            "static credentials cannot be renewed".to_string(),
        ))
    }

    fn on_credential_renewed(&self, credential: &Credential) {
        *self.current.write() = Some(credential.clone());
    }

    fn on_session_terminated(&self) {
        *self.current.write() = None;
    }
}

// ============================================================================
// Refresh-token credentials
// ============================================================================

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Access/refresh token pair renewed against an HTTP refresh endpoint.
///
/// Renewal POSTs `{"refresh_token": ...}` to `refresh_url` and expects
/// `{"access_token": ..., "refresh_token"?: ...}` back. A rotated refresh
/// token replaces the stored one.
pub struct RefreshTokenCredentials {
    client: reqwest::Client,
    refresh_url: String,
    access: RwLock<Option<Credential>>,
    refresh: RwLock<Option<Credential>>,
}

impl RefreshTokenCredentials {
    pub fn new(
        refresh_url: impl Into<String>,
        access: Option<Credential>,
        refresh: Option<Credential>,
        timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::Unavailable(format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            refresh_url: refresh_url.into(),
            access: RwLock::new(access),
            refresh: RwLock::new(refresh),
        })
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh.read().is_some()
    }
}

#[async_trait]
impl CredentialSource for RefreshTokenCredentials {
    fn current_credential(&self) -> Option<Credential> {
        self.access.read().clone()
    }

    async fn renew_credential(&self) -> Result<Option<Credential>, CredentialError> {
        let Some(refresh) = self.refresh.read().clone() else {
            return Ok(None);
        };

        let response = self
            .client
            .post(&self.refresh_url)
            .json(&serde_json::json!({ "refresh_token": refresh.expose() }))
            .send()
            .await
            .map_err(|e| CredentialError::Unavailable(format!("refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "refresh endpoint rejected renewal");
            return Err(CredentialError::Rejected(format!("{status}: {body}")));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Rejected(format!("invalid refresh response: {e}")))?;

        if let Some(rotated) = parsed.refresh_token {
            *self.refresh.write() = Some(Credential::new(rotated));
        }
        Ok(Some(Credential::new(parsed.access_token)))
    }

    fn on_credential_renewed(&self, credential: &Credential) {
        *self.access.write() = Some(credential.clone());
    }

    fn on_session_terminated(&self) {
        *self.access.write() = None;
        *self.refresh.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    #[test]
    fn debug_output_is_redacted() {
        let credential = Credential::new("super-secret");
        assert_eq!(format!("{credential:?}"), "Credential(***)");
        assert_eq!(credential.expose(), "super-secret");
    }

    #[tokio::test]
    async fn static_credentials_cannot_renew_and_clear_on_termination() {
        let source = StaticCredentials::new(Some("token".into()));
        assert_eq!(source.current_credential(), Some(Credential::new("token")));
        assert!(source.renew_credential().await.is_err());

        source.on_session_terminated();
        assert_eq!(source.current_credential(), None);
    }

    #[tokio::test]
    async fn refresh_token_credentials_rotate_tokens() {
        let server = MockServer::start_async().await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/auth/refresh")
                    .json_body(json!({ "refresh_token": "refresh-1" }));
                then.status(200).json_body(json!({
                    "access_token": "access-2",
                    "refresh_token": "refresh-2"
                }));
            })
            .await;

        let source = RefreshTokenCredentials::new(
            server.url("/auth/refresh"),
            Some("access-1".into()),
            Some("refresh-1".into()),
            Duration::from_secs(5),
        )
        .unwrap();

        let renewed = source.renew_credential().await.unwrap();
        assert_eq!(renewed, Some(Credential::new("access-2")));
        refresh.assert_async().await;
        assert_eq!(source.refresh.read().clone(), Some(Credential::new("refresh-2")));

        // The core reports the new token back; the source does not self-apply it.
        assert_eq!(source.current_credential(), Some(Credential::new("access-1")));
        source.on_credential_renewed(&Credential::new("access-2"));
        assert_eq!(source.current_credential(), Some(Credential::new("access-2")));
    }

    #[tokio::test]
    async fn refresh_rejection_is_an_error() {
        let server = MockServer::start_async().await;
        let _refresh = server
            .mock_async(|when, then| {
                when.method(POST).path("/auth/refresh");
                then.status(401).body("refresh token expired");
            })
            .await;

        let source = RefreshTokenCredentials::new(
            server.url("/auth/refresh"),
            None,
            Some("stale".into()),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = source.renew_credential().await.unwrap_err();
        assert!(matches!(err, CredentialError::Rejected(_)));
    }

    #[tokio::test]
    async fn missing_refresh_token_renews_to_nothing() {
        let source =
            RefreshTokenCredentials::new("http://127.0.0.1:9/refresh", None, None, Duration::from_secs(1))
                .unwrap();
        assert!(!source.has_refresh_token());
        assert_eq!(source.renew_credential().await.unwrap(), None);
    }
}
