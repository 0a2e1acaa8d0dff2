//! WebSocket transport over tokio-tungstenite.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use super::{Frame, Transport, TransportError, TransportLink, TransportPeer, TransportSignal};
use crate::config::DEFAULT_TOKEN_QUERY_PARAM;
use crate::credentials::CredentialSource;

/// Dials a `ws://` or `wss://` endpoint for every `open`.
///
/// When a credential source is attached, its current token is appended to the
/// URL as a query parameter at dial time, so reconnects always carry the
/// freshest token.
pub struct WebSocketTransport {
    url: String,
    credentials: Option<Arc<dyn CredentialSource>>,
    token_param: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            token_param: DEFAULT_TOKEN_QUERY_PARAM.to_string(),
        }
    }

    pub fn with_credentials(
        mut self,
        credentials: Arc<dyn CredentialSource>,
        token_param: impl Into<String>,
    ) -> Self {
        self.credentials = Some(credentials);
        self.token_param = token_param.into();
        self
    }

    /// The URL to dial, including the token parameter if one is available.
    pub fn endpoint(&self) -> Result<String, TransportError> {
        let url = self.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }

        let token = self
            .credentials
            .as_ref()
            .and_then(|source| source.current_credential());
        let Some(token) = token else {
            return Ok(url.to_string());
        };

        let separator = if url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{url}{separator}{}={}",
            urlencoding::encode(&self.token_param),
            urlencoding::encode(token.expose())
        ))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        let endpoint = self.endpoint()?;
        debug!(url = %self.url, "opening websocket");

        let (ws, response) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(TransportError::connection)?;
        info!(url = %self.url, status = %response.status(), "websocket open");

        let (mut sink, mut stream) = ws.split();
        let (link, peer) = TransportLink::channel();
        let TransportPeer {
            mut frames,
            signals,
        } = peer;

        // Writer: drains the manager's outbound queue. The queue closing means
        // the manager dropped the link, so close the socket politely.
        let writer_signals = signals.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                trace!(bytes = frame.len(), "websocket send");
                let message = match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Binary(bytes) => Message::Binary(bytes.into()),
                };
                if let Err(e) = sink.send(message).await {
                    warn!("websocket write failed: {e}");
                    let _ = writer_signals.send(TransportSignal::Error(e.to_string()));
                    return;
                }
            }
            if let Err(e) = sink.close().await {
                debug!("websocket close handshake failed: {e}");
            }
        });

        // Reader: forwards frames until the socket closes or the manager
        // stops listening. Once both tasks end the socket is dropped, even if
        // the peer never answers the close handshake.
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    () = signals.closed() => {
                        debug!("websocket link released; stopping reader");
                        return;
                    }
                };
                let Some(item) = item else {
                    break;
                };
                let signal = match item {
                    Ok(Message::Text(text)) => TransportSignal::Frame(Frame::Text(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => TransportSignal::Frame(Frame::Binary(bytes.to_vec())),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        let _ = signals.send(TransportSignal::Closed { code, reason });
                        return;
                    }
                    // Ping/pong are answered by tungstenite itself.
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = signals.send(TransportSignal::Error(e.to_string()));
                        return;
                    }
                };
                if signals.send(signal).is_err() {
                    return;
                }
            }
            let _ = signals.send(TransportSignal::Closed {
                code: None,
                reason: "websocket stream ended".to_string(),
            });
        });

        Ok(link)
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, StaticCredentials};

    #[test]
    fn endpoint_without_credentials_is_unchanged() {
        let transport = WebSocketTransport::new("wss://example.test/socket");
        assert_eq!(transport.endpoint().unwrap(), "wss://example.test/socket");
    }

    #[test]
    fn endpoint_appends_encoded_token() {
        let source = Arc::new(StaticCredentials::new(Some(Credential::new("a b/c"))));
        let transport =
            WebSocketTransport::new("wss://example.test/socket").with_credentials(source, "token");
        assert_eq!(
            transport.endpoint().unwrap(),
            "wss://example.test/socket?token=a%20b%2Fc"
        );

        let source = Arc::new(StaticCredentials::new(Some(Credential::new("t"))));
        let transport = WebSocketTransport::new("ws://example.test/socket?room=7")
            .with_credentials(source, "access_token");
        assert_eq!(
            transport.endpoint().unwrap(),
            "ws://example.test/socket?room=7&access_token=t"
        );
    }

    #[test]
    fn endpoint_rejects_non_websocket_urls() {
        let transport = WebSocketTransport::new("https://example.test");
        assert!(matches!(
            transport.endpoint(),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn missing_token_leaves_url_bare() {
        let source = Arc::new(StaticCredentials::new(None));
        let transport =
            WebSocketTransport::new("wss://example.test/socket").with_credentials(source, "token");
        assert_eq!(transport.endpoint().unwrap(), "wss://example.test/socket");
    }
}
