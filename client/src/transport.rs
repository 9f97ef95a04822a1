//! Relay transport
//!
//! The tunnel driver only talks to the relay through [`Connector`] and
//! [`RelayLink`], so tests can swap the WebSocket for in-memory channels.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use homeport_shared::error::{AuthError, TransportError};
use homeport_shared::protocol::{Frame, MAX_MESSAGE_SIZE};
use homeport_shared::{Error, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// An open, framed connection to the relay
pub trait RelayLink: Send {
    fn send(&mut self, frame: Frame) -> impl Future<Output = std::result::Result<(), TransportError>> + Send;

    /// Next frame from the relay. `None` once the relay has closed the connection.
    fn recv(&mut self) -> impl Future<Output = Option<std::result::Result<Frame, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens relay links
pub trait Connector: Send + Sync {
    type Link: RelayLink;

    fn connect(&self, relay_url: &str, token: &str) -> impl Future<Output = Result<Self::Link>> + Send;
}

/// WebSocket connector for real relays
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    max_message_size: usize,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration, max_message_size: usize) -> Self {
        Self {
            connect_timeout,
            max_message_size,
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), MAX_MESSAGE_SIZE)
    }
}

/// Append the token as a query parameter; some proxies strip `Authorization`.
pub fn url_with_token(relay_url: &str, token: &str) -> String {
    let separator = if relay_url.contains('?') { '&' } else { '?' };
    let token: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    format!("{}{}token={}", relay_url, separator, token)
}

impl Connector for WsConnector {
    type Link = WsLink;

    async fn connect(&self, relay_url: &str, token: &str) -> Result<WsLink> {
        if !(relay_url.starts_with("ws://") || relay_url.starts_with("wss://")) {
            return Err(Error::InvalidUrl(relay_url.to_string()));
        }

        let mut request = url_with_token(relay_url, token)
            .into_client_request()
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", relay_url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| AuthError::InvalidToken("token contains invalid characters".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);

        info!("Connecting to relay: {}", relay_url);
        let connect = connect_async_with_config(request, Some(config), false);
        let (stream, _) = match tokio::time::timeout(self.connect_timeout, connect).await {
            Err(_) => {
                return Err(AuthError::Unreachable(format!("connect timed out after {:?}", self.connect_timeout)).into())
            }
            Ok(Err(e)) => return Err(classify_handshake_error(e)),
            Ok(Ok(pair)) => pair,
        };

        Ok(WsLink { inner: stream })
    }
}

/// Map a handshake failure onto the auth taxonomy.
fn classify_handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN =>
        {
            AuthError::InvalidToken(format!("relay answered HTTP {}", response.status())).into()
        }
        tungstenite::Error::Http(response) => {
            AuthError::Unreachable(format!("relay answered HTTP {}", response.status())).into()
        }
        tungstenite::Error::Url(e) => Error::InvalidUrl(e.to_string()),
        other => AuthError::Unreachable(other.to_string()).into(),
    }
}

/// Relay link over a WebSocket
pub struct WsLink {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayLink for WsLink {
    async fn send(&mut self, frame: Frame) -> std::result::Result<(), TransportError> {
        let data = frame
            .encode()
            .map_err(|e| TransportError::FrameEncodeFailure(e.to_string()))?;
        self.inner
            .send(Message::Binary(data))
            .await
            .map_err(|e| TransportError::ConnectionDropped(e.to_string()))
    }

    async fn recv(&mut self) -> Option<std::result::Result<Frame, TransportError>> {
        loop {
            let msg = match self.inner.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::ConnectionDropped(e.to_string()))),
            };
            let decoded = match msg {
                Message::Binary(data) => Frame::decode(&data),
                Message::Text(text) => Frame::decode(text.as_bytes()),
                Message::Ping(data) => {
                    if let Err(e) = self.inner.send(Message::Pong(data)).await {
                        return Some(Err(TransportError::ConnectionDropped(e.to_string())));
                    }
                    continue;
                }
                Message::Close(reason) => {
                    debug!(?reason, "Relay sent close");
                    return None;
                }
                Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(decoded.map_err(|e| TransportError::FrameDecodeFailure(e.to_string())));
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close(None).await {
            debug!(error = %e, "Error closing relay socket");
        }
    }
}
