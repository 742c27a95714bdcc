//! Switch configuration file.
//!
//! ```toml
//! listen = "0.0.0.0:10002"
//! users_file = "/etc/openlan/switch/password"
//! leases_file = "/var/openlan/leases.json"
//!
//! [bridge]
//! aging_timeout = 300
//!
//! [[networks]]
//! name = "default"
//! ip_start = "10.0.0.2"
//! ip_end = "10.0.0.254"
//! ```

use crate::error::{Result, SwitchError};
use crate::network::NetworkConfig;
use crate::server::ServerOptions;
use openlan_network::wire;
use openlan_network::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete switch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Tunnel listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Network for points that do not name one.
    #[serde(default = "default_network")]
    pub default_network: String,

    /// Largest tunnel payload.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outbound queue depth per session.
    #[serde(default = "default_queue_depth")]
    pub session_queue_depth: usize,

    /// Seconds between lease saves; 0 saves only on shutdown.
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,

    /// Account file, `name:password:role` per line.
    #[serde(default)]
    pub users_file: Option<PathBuf>,

    /// Lease table persisted across restarts.
    #[serde(default)]
    pub leases_file: Option<PathBuf>,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:10002".to_string()
}

fn default_network() -> String {
    "default".to_string()
}

fn default_max_frame_size() -> usize {
    wire::DEFAULT_MAX_FRAME_SIZE
}

fn default_queue_depth() -> usize {
    1024
}

fn default_save_interval() -> u64 {
    300
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            default_network: default_network(),
            max_frame_size: default_max_frame_size(),
            session_queue_depth: default_queue_depth(),
            save_interval_secs: default_save_interval(),
            users_file: None,
            leases_file: None,
            bridge: BridgeConfig::default(),
            networks: Vec::new(),
        }
    }
}

impl SwitchConfig {
    /// Loads and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SwitchError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SwitchError::config(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(SwitchError::config("listen address must not be empty"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > wire::MAX_PAYLOAD {
            return Err(SwitchError::config(format!(
                "max_frame_size must be in 1..={}",
                wire::MAX_PAYLOAD
            )));
        }
        if self.session_queue_depth == 0 {
            return Err(SwitchError::config("session_queue_depth must be > 0"));
        }
        self.bridge.validate()?;

        let mut names = HashSet::new();
        for network in &self.networks {
            network.validate()?;
            if !names.insert(network.name.as_str()) {
                return Err(SwitchError::config(format!(
                    "network '{}' is defined twice",
                    network.name
                )));
            }
        }
        if !self.networks.is_empty() && !names.contains(self.default_network.as_str()) {
            return Err(SwitchError::NetworkNotFound(self.default_network.clone()));
        }
        Ok(())
    }

    /// Interval of periodic lease saves.
    pub fn save_interval(&self) -> Option<Duration> {
        (self.save_interval_secs > 0).then(|| Duration::from_secs(self.save_interval_secs))
    }

    /// Listener settings.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            listen: self.listen.clone(),
            max_frame_size: self.max_frame_size,
            default_network: self.default_network.clone(),
            queue_depth: self.session_queue_depth,
        }
    }
}
