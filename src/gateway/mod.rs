//! Authenticated request gateway.
//!
//! Wraps one-shot HTTP calls with:
//! - Credential attachment, read fresh from the [`CredentialSource`] per call
//! - Expiry detection by response status
//! - Single-flight renewal shared by all concurrent callers
//! - At most one retry per call
//!
//! Callers only see [`Gateway::request`]; the renewal machinery is internal.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::credentials::{Credential, CredentialSource};

mod renewal;
mod types;


pub use renewal::{RenewalCoordinator, RenewalOutcome};
pub use types::{GatewayError, GatewayResponse, RequestOptions};

use renewal::Ticket;

/// Issues authenticated calls against one API. Cheap to clone; clones share
/// the renewal state.
#[derive(Clone)]
pub struct Gateway {
    client: reqwest::Client,
    config: Arc<GatewayConfig>,
    credentials: Arc<dyn CredentialSource>,
    renewal: Arc<RenewalCoordinator>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            config: Arc::new(config),
            credentials,
            renewal: Arc::new(RenewalCoordinator::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn renewal_in_flight(&self) -> bool {
        self.renewal.in_flight()
    }

    /// Callers queued behind the in-flight renewal.
    pub fn renewal_waiters(&self) -> usize {
        self.renewal.waiting()
    }

    pub fn renewals_started(&self) -> u64 {
        self.renewal.renewals_started()
    }

    /// Perform one call, renewing the credential once if it was rejected.
    ///
    /// Any response that is not an auth failure comes back unchanged, errors
    /// included. The retry after a renewal is returned as-is, even when it is
    /// rejected again.
    pub async fn request(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<GatewayResponse, GatewayError> {
        let url = self.resolve(target)?;
        let credential = self.credentials.current_credential();
        let response = self.issue(&url, &options, credential.as_ref()).await?;

        let status = response.status().as_u16();
        if !self.config.is_auth_failure(status) {
            return Ok(response);
        }

        info!(status, url = %url, "credential rejected; renewing");
        match self.renew().await {
            RenewalOutcome::Renewed(credential) => {
                debug!(url = %url, "retrying with renewed credential");
                self.issue(&url, &options, Some(&credential)).await
            }
            RenewalOutcome::Failed => Err(GatewayError::SessionExpired),
            RenewalOutcome::Abandoned => Err(GatewayError::RenewalAbandoned),
        }
    }

    pub async fn get(&self, target: &str) -> Result<GatewayResponse, GatewayError> {
        self.request(target, RequestOptions::get()).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        target: &str,
        body: &T,
    ) -> Result<GatewayResponse, GatewayError> {
        self.request(target, RequestOptions::post().json(body)?).await
    }

    pub async fn delete(&self, target: &str) -> Result<GatewayResponse, GatewayError> {
        self.request(target, RequestOptions::delete()).await
    }

    /// Join the renewal in flight, or lead a new one.
    async fn renew(&self) -> RenewalOutcome {
        let guard = match self.renewal.join() {
            Ticket::Leader(guard) => guard,
            Ticket::Waiter(rx) => {
                debug!("renewal in flight; waiting");
                return renewal::wait(rx).await;
            }
        };

        let outcome = match self.credentials.renew_credential().await {
            Ok(Some(credential)) => {
                self.credentials.on_credential_renewed(&credential);
                info!("credential renewed");
                RenewalOutcome::Renewed(credential)
            }
            Ok(None) => {
                warn!("credential source had nothing to renew with");
                RenewalOutcome::Failed
            }
            Err(e) => {
                warn!("credential renewal failed: {e}");
                RenewalOutcome::Failed
            }
        };

        guard.settle(&outcome);
        if outcome == RenewalOutcome::Failed {
            warn!("terminating session after failed renewal");
            self.credentials.on_session_terminated();
        }
        outcome
    }

    fn resolve(&self, target: &str) -> Result<Url, GatewayError> {
        let target = target.trim();
        let joined = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim().trim_end_matches('/'),
                target.trim_start_matches('/')
            )
        };
        Url::parse(&joined)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid target '{target}': {e}")))
    }

    fn headers(
        &self,
        options: &RequestOptions,
        credential: Option<&Credential>,
    ) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            headers.append(header_name(name)?, header_value(value)?);
        }

        if let Some(credential) = credential {
            let scheme = self.config.auth_scheme.trim();
            let value = if scheme.is_empty() {
                credential.expose().to_string()
            } else {
                format!("{scheme} {}", credential.expose())
            };
            let mut value = header_value(&value)?;
            value.set_sensitive(true);
            headers.insert(header_name(&self.config.auth_header)?, value);
        }
        Ok(headers)
    }

    async fn issue(
        &self,
        url: &Url,
        options: &RequestOptions,
        credential: Option<&Credential>,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut request = self
            .client
            .request(options.method.clone(), url.clone())
            .headers(self.headers(options, credential)?);
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().to_string();
        let body = response.bytes().await?;
        debug!(method = %options.method, url = %url, status = status.as_u16(), "gateway response");

        Ok(GatewayResponse::new(status, headers, final_url, body.to_vec()))
    }
}

fn header_name(name: &str) -> Result<HeaderName, GatewayError> {
    HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid header name '{name}': {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(value)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid header value: {e}")))
}
