//! Homeport client
//!
//! Keeps an outbound WebSocket to a public relay and forwards the traffic
//! it carries to a local home automation backend.

pub mod backoff;
pub mod config;
pub mod ha_config;
pub mod headers;
pub mod relay;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod validator;

pub use config::ClientConfig;
pub use ha_config::{ConfigPatcher, PatchOutcome};
pub use relay::{RelaySettings, RequestRelay};
pub use session::{ConnectionState, TunnelSession};
pub use transport::{Connector, RelayLink, WsConnector};
pub use tunnel::{exit_status, TunnelConnection, TunnelSettings};
