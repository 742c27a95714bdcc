//! Error types for the switch.

use openlan_network::NetworkError;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for switch operations.
pub type Result<T> = std::result::Result<T, SwitchError>;

/// Errors raised by the switch components.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// Configuration could not be read or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The address is already leased to another identity.
    #[error("address {address} is held by '{holder}'")]
    AddressConflict {
        /// Contested address.
        address: Ipv4Addr,
        /// Identity holding it.
        holder: String,
    },

    /// No network of that name is registered.
    #[error("network '{0}' not found")]
    NetworkNotFound(String),

    /// A stored record could not be parsed.
    #[error("invalid record in {path}: {message}")]
    InvalidRecord {
        /// Source file.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// Bridge or framing error.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket or file error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SwitchError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an invalid record error.
    pub fn invalid_record(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns true if a retry may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            SwitchError::Io(_) => true,
            SwitchError::Network(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SwitchError::AddressConflict {
            address: Ipv4Addr::new(10, 0, 0, 2),
            holder: "u1".into(),
        };
        assert_eq!(err.to_string(), "address 10.0.0.2 is held by 'u1'");
        assert_eq!(
            SwitchError::NetworkNotFound("lab".into()).to_string(),
            "network 'lab' not found"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(SwitchError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_retryable());
        assert!(!SwitchError::config("bad listen address").is_retryable());
        assert!(!SwitchError::NetworkNotFound("lab".into()).is_retryable());
    }
}
