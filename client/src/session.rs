//! Tunnel session state machine
//!
//! [`TunnelSession::apply`] is the only place a connection state changes.
//! It is pure apart from the backoff bookkeeping, so every transition can be
//! exercised without sockets; the async driver in `tunnel` executes the
//! returned [`Action`].

use std::fmt;
use std::time::Duration;

use homeport_shared::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffPolicy};

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// Terminal: stop requested by the operator
    ShutdownRequested,
    /// Terminal: non-retryable failure
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::ShutdownRequested | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::ShutdownRequested => "shutdown-requested",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine
#[derive(Debug)]
pub enum Event {
    /// Process start: first attempt, no delay
    Started,
    /// Backoff delay elapsed
    RetryElapsed,
    /// Outbound socket is open
    SocketOpened,
    /// Relay acknowledged the token
    AuthAccepted,
    /// Any failure while connecting, authenticating or connected
    Failed(Error),
    /// Operator asked to stop
    StopRequested,
}

/// Side effect the driver must perform next
#[derive(Debug)]
pub enum Action {
    /// Sleep, then feed [`Event::RetryElapsed`]
    Wait(Duration),
    /// Open the relay socket
    OpenSocket,
    /// Send the token and await the acknowledgement
    Authenticate,
    /// Relay frames until the session ends
    RunSession,
    /// Close the socket and exit successfully
    Stop,
    /// Exit with this error
    Abort(Error),
    /// Event does not apply in the current state
    Ignore,
}

/// One logical connection to the relay
#[derive(Debug)]
pub struct TunnelSession {
    token: String,
    relay_url: String,
    state: ConnectionState,
    last_activity: Instant,
    backoff: Backoff,
    attempts: u32,
}

impl TunnelSession {
    pub fn new(token: impl Into<String>, relay_url: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self {
            token: token.into(),
            relay_url: relay_url.into(),
            state: ConnectionState::Disconnected,
            last_activity: Instant::now(),
            backoff: Backoff::new(policy),
            attempts: 0,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current backoff interval, before jitter
    pub fn backoff_interval(&self) -> Duration {
        self.backoff.current()
    }

    /// Connection attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record inbound traffic from the relay
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Apply an event and return the action the driver must perform.
    pub fn apply(&mut self, event: Event) -> Action {
        use ConnectionState::*;

        if self.state.is_terminal() {
            return Action::Ignore;
        }

        let (next, action) = match (self.state, event) {
            (_, Event::StopRequested) => (ShutdownRequested, Action::Stop),

            (Disconnected, Event::Started) | (Disconnected, Event::RetryElapsed) => {
                self.attempts = self.attempts.saturating_add(1);
                (Connecting, Action::OpenSocket)
            }

            (Connecting, Event::SocketOpened) => (Authenticating, Action::Authenticate),

            (Authenticating, Event::AuthAccepted) => {
                self.backoff.reset();
                self.touch();
                (Connected, Action::RunSession)
            }

            (Connecting | Authenticating | Connected, Event::Failed(err)) => {
                if err.is_retryable() {
                    let delay = self.backoff.next_delay();
                    warn!(error = %err, state = %self.state, delay_ms = delay.as_millis() as u64, "Tunnel disconnected");
                    (Disconnected, Action::Wait(delay))
                } else {
                    (Failed, Action::Abort(err))
                }
            }

            (state, event) => {
                debug!(%state, ?event, "Ignoring event");
                return Action::Ignore;
            }
        };

        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeport_shared::error::{AuthError, TransportError};

    fn session() -> TunnelSession {
        TunnelSession::new(
            "tok-123",
            "wss://relay.example.com/ws/tunnel",
            BackoffPolicy {
                floor: Duration::from_secs(1),
                ceiling: Duration::from_secs(8),
                multiplier: 2.0,
                jitter: 0.0,
            },
        )
    }

    fn dropped() -> Error {
        TransportError::ConnectionDropped("reset".into()).into()
    }

    fn connect(s: &mut TunnelSession) {
        assert!(matches!(s.apply(Event::SocketOpened), Action::Authenticate));
        assert!(matches!(s.apply(Event::AuthAccepted), Action::RunSession));
        assert_eq!(s.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_happy_path_without_backoff() {
        let mut s = session();
        assert!(matches!(s.apply(Event::Started), Action::OpenSocket));
        assert_eq!(s.state(), ConnectionState::Connecting);
        connect(&mut s);
        assert_eq!(s.attempts(), 1);
        assert_eq!(s.backoff_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_failures_grow_backoff_to_ceiling() {
        let mut s = session();
        s.apply(Event::Started);

        let mut waits = Vec::new();
        for _ in 0..6 {
            match s.apply(Event::Failed(dropped())) {
                Action::Wait(d) => waits.push(d.as_secs()),
                other => panic!("unexpected action: {:?}", other),
            }
            assert_eq!(s.state(), ConnectionState::Disconnected);
            assert!(matches!(s.apply(Event::RetryElapsed), Action::OpenSocket));
        }
        assert_eq!(waits, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(s.attempts(), 7);
    }

    #[test]
    fn test_connected_resets_backoff() {
        let mut s = session();
        s.apply(Event::Started);
        for _ in 0..3 {
            s.apply(Event::Failed(AuthError::Unreachable("refused".into()).into()));
            s.apply(Event::RetryElapsed);
        }
        assert_eq!(s.backoff_interval(), Duration::from_secs(8));

        connect(&mut s);
        assert_eq!(s.backoff_interval(), Duration::from_secs(1));

        match s.apply(Event::Failed(TransportError::HeartbeatTimeout(Duration::from_secs(30)).into())) {
            Action::Wait(d) => assert_eq!(d, Duration::from_secs(1)),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_token_is_terminal() {
        let mut s = session();
        s.apply(Event::Started);
        s.apply(Event::SocketOpened);
        match s.apply(Event::Failed(AuthError::InvalidToken("inactive".into()).into())) {
            Action::Abort(Error::Auth(AuthError::InvalidToken(reason))) => assert_eq!(reason, "inactive"),
            other => panic!("unexpected action: {:?}", other),
        }
        assert_eq!(s.state(), ConnectionState::Failed);
        assert!(matches!(s.apply(Event::RetryElapsed), Action::Ignore));
        assert!(matches!(s.apply(Event::Started), Action::Ignore));
    }

    #[test]
    fn test_stop_from_any_live_state() {
        for steps in 0..4 {
            let mut s = session();
            let events = [Event::Started, Event::SocketOpened, Event::AuthAccepted];
            for event in events.into_iter().take(steps) {
                s.apply(event);
            }
            assert!(matches!(s.apply(Event::StopRequested), Action::Stop));
            assert_eq!(s.state(), ConnectionState::ShutdownRequested);
            assert!(matches!(s.apply(Event::Started), Action::Ignore));
        }
    }

    #[test]
    fn test_out_of_order_events_ignored() {
        let mut s = session();
        assert!(matches!(s.apply(Event::AuthAccepted), Action::Ignore));
        assert!(matches!(s.apply(Event::SocketOpened), Action::Ignore));
        assert_eq!(s.state(), ConnectionState::Disconnected);

        s.apply(Event::Started);
        assert!(matches!(s.apply(Event::RetryElapsed), Action::Ignore));
        assert_eq!(s.state(), ConnectionState::Connecting);
    }
}
