//! Relay wire protocol for Homeport.
//!
//! Every WebSocket message between the client and the relay carries one
//! JSON-encoded [`Frame`], tagged by its `type` field. Bodies and WebSocket
//! payloads travel as base64 strings.

use serde::{Deserialize, Serialize};

/// Maximum message size accepted from the relay (10 MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Largest body or WebSocket payload that still fits in one message once
/// base64-encoded, leaving room for the envelope and headers.
pub const MAX_BODY_SIZE: usize = MAX_MESSAGE_SIZE / 4 * 3 - 64 * 1024;

/// Header list as carried on the wire: ordered, names compared case-insensitively.
pub type Headers = Vec<(String, String)>;

/// Frames exchanged over the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client authentication, first frame after the socket opens
    Auth { token: String },
    /// Relay accepted the token
    AuthAccepted {
        #[serde(default)]
        url: Option<String>,
    },
    /// Relay rejected the token (invalid or inactive)
    AuthRejected { reason: String },
    /// HTTP request to forward to the local backend
    HttpRequest {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        query: String,
        #[serde(default)]
        headers: Headers,
        #[serde(default, with = "base64_opt")]
        body: Option<Vec<u8>>,
    },
    /// Response from the local backend
    HttpResponse {
        id: String,
        status: u16,
        headers: Headers,
        #[serde(default, with = "base64_opt")]
        body: Option<Vec<u8>>,
    },
    /// Browser opened a WebSocket through the relay
    WsOpen {
        id: String,
        path: String,
        #[serde(default)]
        query: String,
        #[serde(default)]
        headers: Headers,
    },
    /// One WebSocket message, either direction
    WsData {
        id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(default)]
        text: bool,
    },
    /// WebSocket stream closed, either direction
    WsClose { id: String },
    /// Heartbeat ping
    Ping { ts: u64 },
    /// Heartbeat pong
    Pong { ts: u64 },
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl Frame {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Correlation id, for frames that belong to a proxied request or stream.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Frame::HttpRequest { id, .. }
            | Frame::HttpResponse { id, .. }
            | Frame::WsOpen { id, .. }
            | Frame::WsData { id, .. }
            | Frame::WsClose { id } => Some(id),
            _ => None,
        }
    }
}

/// Kind of work a [`ProxiedRequest`] represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Http,
    WebSocketUpgrade,
    WebSocketFrame { text: bool },
}

/// One inbound unit of work multiplexed over the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedRequest {
    pub id: String,
    pub kind: ProtocolKind,
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl ProxiedRequest {
    /// Build the request carried by an inbound frame.
    ///
    /// Returns `None` for frames that are not units of work (auth, heartbeat,
    /// close, responses).
    pub fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::HttpRequest { id, method, path, query, headers, body } => Some(Self {
                id,
                kind: ProtocolKind::Http,
                method,
                path,
                query,
                headers,
                body,
            }),
            Frame::WsOpen { id, path, query, headers } => Some(Self {
                id,
                kind: ProtocolKind::WebSocketUpgrade,
                method: "GET".to_string(),
                path,
                query,
                headers,
                body: None,
            }),
            Frame::WsData { id, data, text } => Some(Self {
                id,
                kind: ProtocolKind::WebSocketFrame { text },
                method: String::new(),
                path: String::new(),
                query: String::new(),
                headers: Vec::new(),
                body: Some(data),
            }),
            _ => None,
        }
    }

    /// Path plus query string, as sent to the backend.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// Response to a [`ProxiedRequest`], routed back by correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedResponse {
    pub id: String,
    pub status: u16,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl ProxiedResponse {
    /// Plain-text response synthesized by the client itself.
    pub fn text(id: impl Into<String>, status: u16, message: &str) -> Self {
        Self {
            id: id.into(),
            status,
            headers: vec![("Content-Type".to_string(), "text/plain; charset=utf-8".to_string())],
            body: Some(message.as_bytes().to_vec()),
        }
    }
}

impl From<ProxiedResponse> for Frame {
    fn from(resp: ProxiedResponse) -> Self {
        Frame::HttpResponse {
            id: resp.id,
            status: resp.status,
            headers: resp.headers,
            body: resp.body,
        }
    }
}
