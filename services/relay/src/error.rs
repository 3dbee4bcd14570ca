//! Error types for the relay engine.

use std::io;

use thiserror::Error;

/// Relay errors.
///
/// Only `InvalidAddress`, `Config` and `Bind` are fatal, and only at startup.
/// Everything else is recovered from by the component that observes it.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed address string.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A local listener could not be bound.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Backend has no live link installed.
    #[error("backend {0} is not connected")]
    NotConnected(String),

    /// The backend link rejected a write.
    #[error("transport error on backend {backend}: {source}")]
    Transport {
        backend: String,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    pub(crate) fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}
