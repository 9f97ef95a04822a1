//! Homeport Shared Library
//!
//! Relay wire protocol and error types shared by the tunnel client.

pub mod protocol;
pub mod error;

pub use error::{Error, Result};
