//! Point configuration.
//!
//! Loaded from a TOML file such as:
//!
//! ```toml
//! server = "switch.example.net:10002"
//! name = "alice"
//! password = "secret"
//! network = "default"
//! ```

use crate::error::{Result, TunnelError};
use openlan_network::wire::{Login, DEFAULT_MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

fn default_server() -> String {
    "127.0.0.1:10002".to_string()
}

fn default_network() -> String {
    "default".to_string()
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_reconnect_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_outbound_depth() -> usize {
    10240
}

/// Settings of one point (tunnel endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointConfig {
    /// Switch address, `host:port`.
    #[serde(default = "default_server")]
    pub server: String,

    /// Login name.
    #[serde(default)]
    pub name: String,

    /// Login password.
    #[serde(default)]
    pub password: String,

    /// Network to join on the switch.
    #[serde(default = "default_network")]
    pub network: String,

    /// Stable identity for lease allocation; generated by `correct()`.
    #[serde(default)]
    pub uuid: Option<String>,

    /// Human readable alias reported with the lease.
    #[serde(default)]
    pub alias: Option<String>,

    /// Largest payload read from or written to the socket.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Seconds between reconnect attempts.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Seconds allowed for one TCP connect.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Depth of the outbound queue.
    #[serde(default = "default_outbound_depth")]
    pub outbound_depth: usize,
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            name: String::new(),
            password: String::new(),
            network: default_network(),
            uuid: None,
            alias: None,
            max_frame_size: default_max_frame_size(),
            reconnect_interval_secs: default_reconnect_interval(),
            connect_timeout_secs: default_connect_timeout(),
            outbound_depth: default_outbound_depth(),
        }
    }
}

impl PointConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content).map_err(|e| {
            TunnelError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.correct();
        config.validate()?;
        Ok(config)
    }

    /// Decodes TOML text without validating it.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TunnelError::config(e.to_string()))
    }

    /// Splits `name:password` into the login fields. A missing password
    /// keeps the current one.
    pub fn set_auth(&mut self, auth: &str) {
        let mut values = auth.splitn(2, ':');
        self.name = values.next().unwrap_or_default().to_string();
        if let Some(password) = values.next() {
            self.password = password.to_string();
        }
    }

    /// Fills in derived defaults: a random identity and the alias.
    pub fn correct(&mut self) {
        if self.uuid.as_deref().unwrap_or_default().is_empty() {
            self.uuid = Some(uuid::Uuid::new_v4().to_string());
        }
        if self.alias.as_deref().unwrap_or_default().is_empty() && !self.name.is_empty() {
            self.alias = Some(self.name.clone());
        }
    }

    /// Rejects configurations the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(TunnelError::config("server must not be empty"));
        }
        if self.name.is_empty() {
            return Err(TunnelError::config("name must not be empty"));
        }
        if self.max_frame_size < openlan_network::ETHERNET_HEADER_LEN {
            return Err(TunnelError::config(format!(
                "max_frame_size {} is smaller than an Ethernet header",
                self.max_frame_size
            )));
        }
        if self.max_frame_size > openlan_network::wire::MAX_PAYLOAD {
            return Err(TunnelError::config(format!(
                "max_frame_size {} exceeds {}",
                self.max_frame_size,
                openlan_network::wire::MAX_PAYLOAD
            )));
        }
        if self.outbound_depth == 0 {
            return Err(TunnelError::config("outbound_depth must be greater than 0"));
        }
        Ok(())
    }

    /// Reconnect backoff.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Login request body for this point.
    pub fn login(&self) -> Login {
        Login {
            name: self.name.clone(),
            password: self.password.clone(),
            uuid: self.uuid.clone(),
            alias: self.alias.clone(),
            network: Some(self.network.clone()),
        }
    }
}
