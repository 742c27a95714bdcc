//! Error types for the point side of a tunnel.

use openlan_network::NetworkError;
use std::io;
use thiserror::Error;

/// Result type alias for point operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors raised by the tunnel worker and point configuration.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration could not be read or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// TCP connect to the switch failed.
    #[error("connect to {server} failed: {source}")]
    Connect {
        /// Switch address.
        server: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// TCP connect did not finish in time.
    #[error("connect to {server} timed out")]
    ConnectTimeout {
        /// Switch address.
        server: String,
    },

    /// No socket is established.
    #[error("not connected")]
    NotConnected,

    /// The worker was stopped and no longer accepts frames.
    #[error("tunnel worker '{0}' is stopped")]
    Stopped(String),

    /// Framing or bridge error.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// JSON encoding of an instruction body failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket or file error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if the receive loop may recover by reconnecting.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::Connect { .. }
            | TunnelError::ConnectTimeout { .. }
            | TunnelError::NotConnected
            | TunnelError::Io(_) => true,
            TunnelError::Network(e) => e.is_retryable(),
            TunnelError::Config(_) | TunnelError::Stopped(_) | TunnelError::Json(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        let connect = TunnelError::Connect {
            server: "10.0.0.1:10002".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(connect.is_retryable());
        assert!(TunnelError::NotConnected.is_retryable());
        assert!(!TunnelError::from(NetworkError::malformed("bad magic")).is_retryable());
        assert!(!TunnelError::config("missing server").is_retryable());
        assert!(!TunnelError::Stopped("alice".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = TunnelError::ConnectTimeout {
            server: "switch:10002".into(),
        };
        assert_eq!(err.to_string(), "connect to switch:10002 timed out");
    }
}
