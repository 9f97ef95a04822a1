use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use homeport::relay::StreamInput;
use homeport::{RelaySettings, RequestRelay};
use homeport_shared::protocol::{Frame, ProtocolKind, ProxiedRequest, MAX_BODY_SIZE};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn echo_headers(headers: HeaderMap) -> Json<Vec<(String, String)>> {
    Json(
        headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
    )
}

async fn echo_body(body: String) -> impl IntoResponse {
    ([("x-backend", "yes")], body)
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "slow"
}

async fn ws_echo(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            match msg {
                WsMessage::Text(_) | WsMessage::Binary(_) => {
                    if socket.send(msg).await.is_err() {
                        break;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    })
}

async fn ws_hello_then_close(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        let _ = socket.send(WsMessage::Text("hello".into())).await;
        let _ = socket.close().await;
    })
}

async fn backend() -> SocketAddr {
    let app = Router::new()
        .route("/headers", get(echo_headers))
        .route("/echo", post(echo_body))
        .route("/fast", get(|| async { "fast" }))
        .route("/slow", get(slow))
        .route("/huge", get(|| async { vec![b'x'; MAX_BODY_SIZE + 1] }))
        .route("/api/websocket", get(ws_echo))
        .route("/api/hello", get(ws_hello_then_close));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn http(id: &str, method: &str, path: &str) -> ProxiedRequest {
    ProxiedRequest {
        id: id.into(),
        kind: ProtocolKind::Http,
        method: method.into(),
        path: path.into(),
        query: String::new(),
        headers: vec![],
        body: None,
    }
}

fn ws_data(id: &str, text: &str) -> StreamInput {
    StreamInput::Frame(ProxiedRequest {
        id: id.into(),
        kind: ProtocolKind::WebSocketFrame { text: true },
        method: String::new(),
        path: String::new(),
        query: String::new(),
        headers: vec![],
        body: Some(text.as_bytes().to_vec()),
    })
}

#[tokio::test]
async fn test_forwarding_headers_are_stripped() {
    let addr = backend().await;
    let relay = RequestRelay::new(&format!("http://{}", addr), RelaySettings::default()).unwrap();

    let mut req = http("h1", "GET", "/headers");
    req.headers = vec![
        ("X-Forwarded-For".into(), "203.0.113.9".into()),
        ("X-Forwarded-Proto".into(), "https".into()),
        ("X-Real-IP".into(), "203.0.113.9".into()),
        ("Accept-Encoding".into(), "gzip, br".into()),
        ("Connection".into(), "keep-alive".into()),
        ("Authorization".into(), "Bearer llat".into()),
        ("X-Custom".into(), "kept".into()),
    ];

    let resp = relay.handle_http(req).await;
    assert_eq!(resp.id, "h1");
    assert_eq!(resp.status, 200);

    let seen: Vec<(String, String)> = serde_json::from_slice(&resp.body.unwrap()).unwrap();
    let get = |name: &str| seen.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
    assert_eq!(get("x-forwarded-for"), None);
    assert_eq!(get("x-forwarded-proto"), None);
    assert_eq!(get("x-real-ip"), None);
    assert_eq!(get("accept-encoding"), Some("identity"));
    assert_eq!(get("authorization"), Some("Bearer llat"));
    assert_eq!(get("x-custom"), Some("kept"));
}

#[tokio::test]
async fn test_body_and_response_headers() {
    let addr = backend().await;
    let relay = RequestRelay::new(&format!("http://{}/", addr), RelaySettings::default()).unwrap();

    let mut req = http("b1", "POST", "/echo");
    req.headers = vec![("Content-Type".into(), "text/plain".into())];
    req.body = Some(b"turn_on light.kitchen".to_vec());

    let resp = relay.handle_http(req).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body.as_deref(), Some(&b"turn_on light.kitchen"[..]));
    assert!(resp.headers.iter().any(|(k, v)| k == "x-backend" && v == "yes"));
    assert!(!resp
        .headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("content-length") || k.eq_ignore_ascii_case("transfer-encoding")));
}

#[tokio::test]
async fn test_slow_request_does_not_block_fast_one() {
    let addr = backend().await;
    let settings = RelaySettings {
        request_timeout: Duration::from_millis(500),
        ..RelaySettings::default()
    };
    let relay = RequestRelay::new(&format!("http://{}", addr), settings).unwrap();

    let (slow, fast) = tokio::join!(
        relay.handle_http(http("s", "GET", "/slow")),
        relay.handle_http(http("f", "GET", "/fast")),
    );
    assert_eq!(fast.id, "f");
    assert_eq!(fast.status, 200);
    assert_eq!(fast.body.as_deref(), Some(&b"fast"[..]));
    assert_eq!(slow.id, "s");
    assert_eq!(slow.status, 504);
}

#[tokio::test]
async fn test_oversized_response_fails_only_its_request() {
    let addr = backend().await;
    let relay = RequestRelay::new(&format!("http://{}", addr), RelaySettings::default()).unwrap();

    let huge = relay.handle_http(http("big", "GET", "/huge")).await;
    assert_eq!(huge.id, "big");
    assert_eq!(huge.status, 502);
    assert!(Frame::from(huge).encode().unwrap().len() < 1024);

    let fast = relay.handle_http(http("f", "GET", "/fast")).await;
    assert_eq!(fast.status, 200);
}

#[tokio::test]
async fn test_websocket_echo_and_relay_close() {
    let addr = backend().await;
    let relay = RequestRelay::new(&format!("http://{}", addr), RelaySettings::default()).unwrap();

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let mut open = http("w1", "GET", "/api/websocket");
    open.kind = ProtocolKind::WebSocketUpgrade;

    let task = tokio::spawn(async move { relay.relay_websocket(open, in_rx, out_tx).await });

    in_tx.send(ws_data("w1", r#"{"type":"auth"}"#)).unwrap();
    let echoed = timeout(Duration::from_secs(5), out_rx.recv()).await.unwrap();
    assert_eq!(
        echoed,
        Some(Frame::WsData {
            id: "w1".into(),
            data: br#"{"type":"auth"}"#.to_vec(),
            text: true,
        })
    );

    in_tx.send(StreamInput::Close).unwrap();
    timeout(Duration::from_secs(15), task).await.unwrap().unwrap();
    // Closed from the relay side, so no close goes back out
    assert_eq!(out_rx.recv().await, None);
}

#[tokio::test]
async fn test_backend_close_is_reported() {
    let addr = backend().await;
    let relay = RequestRelay::new(&format!("http://{}", addr), RelaySettings::default()).unwrap();

    let (_in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let mut open = http("w2", "GET", "/api/hello");
    open.kind = ProtocolKind::WebSocketUpgrade;

    let task = tokio::spawn(async move { relay.relay_websocket(open, in_rx, out_tx).await });

    let first = timeout(Duration::from_secs(5), out_rx.recv()).await.unwrap();
    assert_eq!(
        first,
        Some(Frame::WsData {
            id: "w2".into(),
            data: b"hello".to_vec(),
            text: true,
        })
    );
    let second = timeout(Duration::from_secs(5), out_rx.recv()).await.unwrap();
    assert_eq!(second, Some(Frame::WsClose { id: "w2".into() }));
    timeout(Duration::from_secs(15), task).await.unwrap().unwrap();
}
