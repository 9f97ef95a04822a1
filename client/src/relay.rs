//! Request relay to the local backend
//!
//! Each proxied HTTP request or WebSocket stream is handled on its own; the
//! tunnel driver spawns one task per correlation id.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use homeport_shared::error::RelayError;
use homeport_shared::protocol::{Frame, Headers, ProtocolKind, ProxiedRequest, ProxiedResponse, MAX_BODY_SIZE};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT_ENCODING};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::headers::{self, normalize_request, normalize_response};

/// Timeouts for talking to the local backend
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Whole HTTP exchange, including the body
    pub request_timeout: Duration,
    /// Opening a WebSocket to the backend
    pub connect_timeout: Duration,
    /// How long a close may take to propagate to the other side
    pub close_grace: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(10),
        }
    }
}

/// Input for a running WebSocket relay unit
#[derive(Debug)]
pub enum StreamInput {
    /// Frame from the relay side, kind `WebSocketFrame`
    Frame(ProxiedRequest),
    /// Relay side closed the stream
    Close,
}

/// Forwards proxied traffic to the local backend
#[derive(Debug, Clone)]
pub struct RequestRelay {
    backend_url: String,
    client: reqwest::Client,
    settings: RelaySettings,
}

impl RequestRelay {
    pub fn new(backend_url: &str, settings: RelaySettings) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            client,
            settings,
        })
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    fn http_url(&self, req: &ProxiedRequest) -> String {
        format!("{}{}", self.backend_url, req.path_and_query())
    }

    fn ws_url(&self, req: &ProxiedRequest) -> String {
        let url = self.http_url(req);
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            url
        }
    }

    /// Forward one HTTP request. Always yields a response for the correlation id.
    pub async fn handle_http(&self, req: ProxiedRequest) -> ProxiedResponse {
        match self.forward(&req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(id = %req.id, "{} {} failed: {}", req.method, req.path, e);
                let message = match &e {
                    RelayError::InvalidRequest(_) => "Invalid request",
                    RelayError::LocalBackendTimeout(_) => "Local backend timed out",
                    RelayError::LocalBackendUnreachable(_) => "Local backend is not responding",
                    RelayError::PayloadTooLarge(_) => "Response too large for the tunnel",
                };
                ProxiedResponse::text(req.id, e.status(), message)
            }
        }
    }

    async fn forward(&self, req: &ProxiedRequest) -> Result<ProxiedResponse, RelayError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| RelayError::InvalidRequest(format!("method {:?}", req.method)))?;
        let url = self.http_url(req);
        debug!(id = %req.id, "Proxying {} {}", method, url);

        let mut builder = self.client.request(method, &url);
        for (name, value) in normalize_request(&req.headers) {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!(id = %req.id, header = %name, "Dropping unrepresentable header"),
            }
        }
        // The relay side only ever sees plain bodies.
        builder = builder.header(ACCEPT_ENCODING, "identity");
        if let Some(body) = req.body.as_ref().filter(|b| !b.is_empty()) {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await.map_err(|e| classify(e, self.settings.request_timeout))?;
        let status = resp.status().as_u16();
        let headers: Headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| classify(e, self.settings.request_timeout))?;

        debug!(
            id = %req.id,
            status,
            bytes = body.len(),
            content_type = headers::get(&headers, "content-type").unwrap_or("-"),
            "Backend responded"
        );
        // One oversized body must not take the tunnel down with it
        if body.len() > MAX_BODY_SIZE {
            return Err(RelayError::PayloadTooLarge(body.len()));
        }
        if status == 400 {
            warn!(
                "Backend returned 400 Bad Request for {}. Make sure its configuration has \
                 http: {{ use_x_forwarded_for: true, trusted_proxies: [172.30.33.0/24] }}",
                req.path
            );
        }

        Ok(ProxiedResponse {
            id: req.id.clone(),
            status,
            headers: normalize_response(&headers),
            body: Some(body.to_vec()),
        })
    }

    /// Relay one WebSocket stream until either side closes.
    ///
    /// Frames from the relay arrive on `inbound` in order; frames from the
    /// backend go out on `outbound` tagged with the stream's correlation id.
    pub async fn relay_websocket(
        &self,
        req: ProxiedRequest,
        mut inbound: mpsc::UnboundedReceiver<StreamInput>,
        outbound: mpsc::Sender<Frame>,
    ) {
        let id = req.id.clone();
        let url = self.ws_url(&req);

        let local = match timeout(self.settings.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(id = %id, "Failed to open WebSocket to backend {}: {}", url, e);
                let _ = outbound.send(Frame::WsClose { id }).await;
                return;
            }
            Err(_) => {
                warn!(id = %id, "Timed out opening WebSocket to backend {}", url);
                let _ = outbound.send(Frame::WsClose { id }).await;
                return;
            }
        };
        info!(id = %id, "WebSocket relay open: {}", req.path);

        let (mut sink, mut stream) = local.split();

        let closed_by_relay = loop {
            tokio::select! {
                input = inbound.recv() => match input {
                    Some(StreamInput::Frame(frame)) => {
                        let Some(msg) = to_message(frame) else { continue };
                        if let Err(e) = sink.send(msg).await {
                            debug!(id = %id, error = %e, "Backend WebSocket send failed");
                            break false;
                        }
                    }
                    Some(StreamInput::Close) | None => break true,
                },
                msg = stream.next() => match msg {
                    Some(Ok(msg)) if msg.len() > MAX_BODY_SIZE => {
                        warn!(id = %id, bytes = msg.len(), "Backend WebSocket message too large for the tunnel, closing");
                        break false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let frame = Frame::WsData { id: id.clone(), data: text.into_bytes(), text: true };
                        if outbound.send(frame).await.is_err() {
                            break true;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let frame = Frame::WsData { id: id.clone(), data, text: false };
                        if outbound.send(frame).await.is_err() {
                            break true;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(id = %id, error = %e, "Backend WebSocket error");
                        break false;
                    }
                },
            }
        };

        if timeout(self.settings.close_grace, sink.close()).await.is_err() {
            debug!(id = %id, "Backend WebSocket close timed out");
        }
        if !closed_by_relay {
            let _ = timeout(self.settings.close_grace, outbound.send(Frame::WsClose { id: id.clone() })).await;
        }
        info!(id = %id, closed_by_relay, "WebSocket relay closed");
    }
}

fn to_message(frame: ProxiedRequest) -> Option<Message> {
    let ProtocolKind::WebSocketFrame { text } = frame.kind else {
        return None;
    };
    let data = frame.body.unwrap_or_default();
    Some(if text {
        Message::Text(String::from_utf8_lossy(&data).into_owned())
    } else {
        Message::Binary(data)
    })
}

fn classify(err: reqwest::Error, limit: Duration) -> RelayError {
    if err.is_timeout() {
        RelayError::LocalBackendTimeout(format!("no response within {:?}", limit))
    } else if err.is_builder() {
        RelayError::InvalidRequest(err.to_string())
    } else {
        RelayError::LocalBackendUnreachable(err.to_string())
    }
}
