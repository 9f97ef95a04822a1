//! Error types for Homeport.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error surfaced by the tunnel client.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),
}

impl Error {
    /// Whether the reconnect loop may try again after this error.
    ///
    /// Only an explicit token rejection and an unusable relay URL stop it;
    /// neither can change without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Auth(AuthError::InvalidToken(_)) | Error::InvalidUrl(_))
    }
}

/// Failures while patching the backend configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    ParseFailure(String),

    #[error("Configuration rejected by validator: {0}")]
    ValidationRejected(String),

    #[error("Configuration validator unreachable: {0}")]
    ValidatorUnreachable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while authenticating against the relay.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Relay rejected token: {0}")]
    InvalidToken(String),

    #[error("Relay unreachable: {0}")]
    Unreachable(String),
}

/// Failures of an established relay connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection dropped: {0}")]
    ConnectionDropped(String),

    #[error("No traffic from relay for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Failed to decode frame: {0}")]
    FrameDecodeFailure(String),

    #[error("Failed to encode frame: {0}")]
    FrameEncodeFailure(String),
}

/// Failures scoped to a single proxied request.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Local backend unreachable: {0}")]
    LocalBackendUnreachable(String),

    #[error("Local backend timed out: {0}")]
    LocalBackendTimeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Payload too large for the tunnel: {0} bytes")]
    PayloadTooLarge(usize),
}

impl RelayError {
    /// Status code of the response synthesized for this failure.
    pub fn status(&self) -> u16 {
        match self {
            RelayError::LocalBackendUnreachable(_) => 502,
            RelayError::LocalBackendTimeout(_) => 504,
            RelayError::InvalidRequest(_) => 400,
            RelayError::PayloadTooLarge(_) => 502,
        }
    }
}
