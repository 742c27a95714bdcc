//! Error types for the bridge, ports and the wire codec.

use std::io;
use thiserror::Error;

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors raised by the bridge, port adapters and frame codec.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The bridge ingress queue has been disposed.
    #[error("bridge '{bridge}' is closed")]
    BridgeClosed {
        /// Name of the bridge.
        bridge: String,
    },

    /// A port could not take the frame (closed socket, full peer, ...).
    #[error("delivery to port '{port}' failed: {message}")]
    Delivery {
        /// Name of the destination port.
        port: String,
        /// Error message.
        message: String,
    },

    /// A wire message violated the framing contract.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A wire message exceeded the configured maximum size.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    Oversized {
        /// Announced payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Bridge configuration rejected by `validate()`.
    #[error("invalid bridge configuration: {0}")]
    InvalidConfig(String),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetworkError {
    /// Creates a bridge closed error.
    pub fn bridge_closed(bridge: impl Into<String>) -> Self {
        Self::BridgeClosed {
            bridge: bridge.into(),
        }
    }

    /// Creates a delivery error.
    pub fn delivery(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Creates a malformed frame error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Returns true if the condition is transient and the caller may recover
    /// locally (reconnect, retry on the next frame).
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetworkError::Delivery { .. } | NetworkError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetworkError::bridge_closed("br-default");
        assert_eq!(err.to_string(), "bridge 'br-default' is closed");

        let err = NetworkError::Oversized { size: 9000, max: 1600 };
        assert_eq!(err.to_string(), "frame of 9000 bytes exceeds maximum 1600");
    }

    #[test]
    fn test_is_retryable() {
        assert!(NetworkError::delivery("tap0", "broken pipe").is_retryable());
        assert!(NetworkError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_retryable());
        assert!(!NetworkError::bridge_closed("br0").is_retryable());
        assert!(!NetworkError::malformed("bad magic").is_retryable());
    }
}
