//! Tunnel connection driver
//!
//! Owns the [`TunnelSession`] and executes the actions its state machine
//! returns: connecting, authenticating, heartbeats, and handing inbound
//! frames to the [`Dispatcher`]. Nothing else mutates the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use homeport_shared::error::{AuthError, TransportError};
use homeport_shared::protocol::{Frame, ProtocolKind, ProxiedRequest};
use homeport_shared::{Error, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::relay::{RequestRelay, StreamInput};
use crate::session::{Action, ConnectionState, Event, TunnelSession};
use crate::transport::{Connector, RelayLink};

/// Outbound frame queue depth
const OUTBOUND_CAPACITY: usize = 100;

/// Timing of the relay session
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Relay must acknowledge the token within this
    pub auth_timeout: Duration,
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
    /// Drop the connection after this long without inbound traffic
    pub heartbeat_timeout: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// How an established session ended
enum SessionEnd {
    Stopped,
    Failed(TransportError),
}

/// Maintains the relay connection for the lifetime of the process
pub struct TunnelConnection<C: Connector> {
    connector: C,
    session: TunnelSession,
    settings: TunnelSettings,
    relay: Arc<RequestRelay>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<C: Connector> TunnelConnection<C> {
    pub fn new(connector: C, session: TunnelSession, settings: TunnelSettings, relay: RequestRelay) -> Self {
        let (state_tx, _) = watch::channel(session.state());
        Self {
            connector,
            session,
            settings,
            relay: Arc::new(relay),
            state_tx,
        }
    }

    /// Observe connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Run until stopped (`Ok`) or a non-retryable error (`Err`).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut link: Option<C::Link> = None;
        let mut action = self.apply(Event::Started);

        loop {
            action = match action {
                Action::Wait(delay) => {
                    info!("Reconnecting in {:.1}s", delay.as_secs_f64());
                    tokio::select! {
                        _ = sleep(delay) => self.apply(Event::RetryElapsed),
                        _ = shutdown.changed() => self.apply(Event::StopRequested),
                    }
                }
                Action::OpenSocket => {
                    let connect = self.connector.connect(self.session.relay_url(), self.session.token());
                    let result = tokio::select! {
                        result = connect => Some(result),
                        _ = shutdown.changed() => None,
                    };
                    match result {
                        None => self.apply(Event::StopRequested),
                        Some(Ok(opened)) => {
                            link = Some(opened);
                            self.apply(Event::SocketOpened)
                        }
                        Some(Err(e)) => self.apply(Event::Failed(e)),
                    }
                }
                Action::Authenticate => match link.as_mut() {
                    None => self.apply(Event::Failed(
                        TransportError::ConnectionDropped("no socket to authenticate".into()).into(),
                    )),
                    Some(l) => {
                        let result = tokio::select! {
                            result = authenticate(l, self.session.token(), self.settings.auth_timeout) => Some(result),
                            _ = shutdown.changed() => None,
                        };
                        match result {
                            None => self.apply(Event::StopRequested),
                            Some(Ok(url)) => {
                                info!("Tunnel active: {}", url.as_deref().unwrap_or("(no public URL reported)"));
                                self.apply(Event::AuthAccepted)
                            }
                            Some(Err(e)) => {
                                link = None;
                                self.apply(Event::Failed(e))
                            }
                        }
                    }
                },
                Action::RunSession => match link.as_mut() {
                    None => self.apply(Event::Failed(
                        TransportError::ConnectionDropped("no socket for session".into()).into(),
                    )),
                    Some(l) => match self.run_session(l, &mut shutdown).await {
                        SessionEnd::Stopped => self.apply(Event::StopRequested),
                        SessionEnd::Failed(e) => {
                            link = None;
                            self.apply(Event::Failed(e.into()))
                        }
                    },
                },
                Action::Stop => {
                    info!("Shutting down tunnel");
                    if let Some(mut l) = link.take() {
                        l.close().await;
                    }
                    return Ok(());
                }
                Action::Abort(e) => {
                    error!("Tunnel stopped: {}", e);
                    if let Some(mut l) = link.take() {
                        l.close().await;
                    }
                    return Err(e);
                }
                Action::Ignore => {
                    // The driver fed an event the current state cannot take;
                    // the state machine cannot make progress from here.
                    let state = self.session.state();
                    error!(%state, "Tunnel state machine stalled");
                    if let Some(mut l) = link.take() {
                        l.close().await;
                    }
                    return Err(TransportError::ConnectionDropped(format!("stalled in state {}", state)).into());
                }
            };
        }
    }

    fn apply(&mut self, event: Event) -> Action {
        let action = self.session.apply(event);
        self.state_tx.send_replace(self.session.state());
        action
    }

    /// Relay frames until the connection fails or a stop is requested.
    async fn run_session(&mut self, link: &mut C::Link, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
        let mut dispatcher = Dispatcher::new(self.relay.clone(), out_tx);

        let mut heartbeat = interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let end = loop {
            tokio::select! {
                frame = link.recv() => match frame {
                    Some(Ok(frame)) => {
                        self.session.touch();
                        match frame {
                            Frame::Ping { ts } => {
                                if let Err(e) = link.send(Frame::Pong { ts }).await {
                                    break SessionEnd::Failed(e);
                                }
                            }
                            Frame::Pong { .. } => {}
                            other => {
                                debug!(id = other.correlation_id().unwrap_or("-"), "Inbound frame");
                                dispatcher.dispatch(other);
                            }
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    None => break SessionEnd::Failed(TransportError::ConnectionDropped("closed by relay".into())),
                },
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = link.send(frame).await {
                        break SessionEnd::Failed(e);
                    }
                }
                _ = heartbeat.tick() => {
                    let idle = self.session.idle_for();
                    if idle >= self.settings.heartbeat_timeout {
                        break SessionEnd::Failed(TransportError::HeartbeatTimeout(idle));
                    }
                    if let Err(e) = link.send(Frame::Ping { ts: now_millis() }).await {
                        break SessionEnd::Failed(e);
                    }
                }
                Some(joined) = dispatcher.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Relay task panicked: {}", e);
                        }
                    }
                    debug!(in_flight = dispatcher.in_flight(), "Relay task finished");
                }
                _ = shutdown.changed() => break SessionEnd::Stopped,
            }
        };

        let in_flight = dispatcher.shutdown();
        if in_flight > 0 {
            info!(in_flight, "Dropped in-flight relays with the session");
        }
        end
    }
}

/// Send the token and wait for the relay's verdict. Returns the public URL, if any.
async fn authenticate<L: RelayLink>(link: &mut L, token: &str, limit: Duration) -> Result<Option<String>> {
    link.send(Frame::Auth { token: token.to_string() })
        .await
        .map_err(|e| AuthError::Unreachable(e.to_string()))?;

    let reply = timeout(limit, link.recv())
        .await
        .map_err(|_| AuthError::Unreachable(format!("no auth acknowledgement within {:?}", limit)))?;

    match reply {
        Some(Ok(Frame::AuthAccepted { url })) => Ok(url),
        Some(Ok(Frame::AuthRejected { reason })) => Err(AuthError::InvalidToken(reason).into()),
        Some(Ok(other)) => Err(AuthError::Unreachable(format!("unexpected frame during auth: {:?}", other)).into()),
        Some(Err(e)) => Err(e.into()),
        None => Err(AuthError::Unreachable("relay closed during auth".into()).into()),
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Routes inbound frames to independent relay tasks, keyed by correlation id.
///
/// Dropping the dispatcher aborts every task it spawned.
pub struct Dispatcher {
    relay: Arc<RequestRelay>,
    outbound: mpsc::Sender<Frame>,
    streams: HashMap<String, mpsc::UnboundedSender<StreamInput>>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(relay: Arc<RequestRelay>, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            relay,
            outbound,
            streams: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::WsClose { id } => {
                if let Some(tx) = self.streams.remove(&id) {
                    let _ = tx.send(StreamInput::Close);
                }
            }
            frame => match ProxiedRequest::from_frame(frame) {
                Some(req) => self.start(req),
                None => warn!("Ignoring unexpected frame from relay"),
            },
        }
    }

    fn start(&mut self, req: ProxiedRequest) {
        match req.kind {
            ProtocolKind::Http => {
                let relay = self.relay.clone();
                let outbound = self.outbound.clone();
                self.tasks.spawn(async move {
                    let resp = relay.handle_http(req).await;
                    if outbound.send(resp.into()).await.is_err() {
                        debug!("Tunnel gone, response abandoned");
                    }
                });
            }
            ProtocolKind::WebSocketUpgrade => {
                self.streams.retain(|_, tx| !tx.is_closed());
                let (tx, rx) = mpsc::unbounded_channel();
                if let Some(previous) = self.streams.insert(req.id.clone(), tx) {
                    warn!(id = %req.id, "Duplicate WebSocket id, closing previous stream");
                    let _ = previous.send(StreamInput::Close);
                }
                let relay = self.relay.clone();
                let outbound = self.outbound.clone();
                self.tasks.spawn(async move {
                    relay.relay_websocket(req, rx, outbound).await;
                });
            }
            ProtocolKind::WebSocketFrame { .. } => match self.streams.get(&req.id) {
                Some(tx) => {
                    let id = req.id.clone();
                    if tx.send(StreamInput::Frame(req)).is_err() {
                        debug!(id = %id, "WebSocket stream already closed");
                        self.streams.remove(&id);
                    }
                }
                None => debug!(id = %req.id, "Data for unknown WebSocket stream"),
            },
        }
    }

    /// Reap a finished task. `None` when nothing is running.
    pub async fn join_next(&mut self) -> Option<std::result::Result<(), tokio::task::JoinError>> {
        self.tasks.join_next().await
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Abort every in-flight task; returns how many were running.
    pub fn shutdown(mut self) -> usize {
        let running = self.tasks.len();
        self.streams.clear();
        self.tasks.abort_all();
        running
    }
}

/// Map a tunnel result to the process exit status.
pub fn exit_status(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(Error::Auth(AuthError::InvalidToken(_))) => 2,
        Err(_) => 1,
    }
}
