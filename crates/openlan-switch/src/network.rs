//! Virtual networks served by the switch.

use crate::error::{Result, SwitchError};
use crate::lease::{Lease, LeaseAllocator};
use openlan_types::AddressRange;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

/// Static address reservation inside a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticLease {
    /// Point UUID.
    pub identity: String,
    /// Display name.
    #[serde(default)]
    pub alias: String,
    /// Reserved address.
    pub address: Ipv4Addr,
}

/// One network: a name and the address pool points draw from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    /// First address handed out.
    #[serde(default)]
    pub ip_start: String,
    /// Last address handed out.
    #[serde(default)]
    pub ip_end: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub static_leases: Vec<StaticLease>,
}

impl NetworkConfig {
    /// Creates a network with a pool and no reservations.
    pub fn new(name: &str, ip_start: &str, ip_end: &str) -> Self {
        Self {
            name: name.to_string(),
            ip_start: ip_start.to_string(),
            ip_end: ip_end.to_string(),
            netmask: String::new(),
            static_leases: Vec::new(),
        }
    }

    /// The pool; empty when either bound is malformed.
    pub fn range(&self) -> AddressRange {
        AddressRange::parse(&self.ip_start, &self.ip_end)
    }

    /// Rejects unnamed networks.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SwitchError::config("network name must not be empty"));
        }
        Ok(())
    }
}

/// Name to network mapping, backed by one shared lease table.
pub struct NetworkRegistry {
    networks: RwLock<HashMap<String, Arc<NetworkConfig>>>,
    leases: Arc<LeaseAllocator>,
}

impl NetworkRegistry {
    /// Creates an empty registry over `leases`.
    pub fn new(leases: Arc<LeaseAllocator>) -> Self {
        Self {
            networks: RwLock::new(HashMap::new()),
            leases,
        }
    }

    /// Shared lease table.
    pub fn leases(&self) -> &Arc<LeaseAllocator> {
        &self.leases
    }

    /// Registers or replaces a network and pins its static leases.
    pub fn add(&self, network: NetworkConfig) -> Result<()> {
        network.validate()?;
        for reservation in &network.static_leases {
            self.leases
                .add_static(&reservation.identity, &reservation.alias, reservation.address)?;
        }
        info!(
            network = %network.name,
            range = %network.range(),
            reservations = network.static_leases.len(),
            "network added"
        );
        self.networks
            .write()
            .insert(network.name.clone(), Arc::new(network));
        Ok(())
    }

    /// Removes a network. Its leases stay until released.
    pub fn remove(&self, name: &str) -> Option<Arc<NetworkConfig>> {
        self.networks.write().remove(name)
    }

    /// Network called `name`.
    pub fn get(&self, name: &str) -> Option<Arc<NetworkConfig>> {
        self.networks.read().get(name).cloned()
    }

    /// Networks sorted by name.
    pub fn list(&self) -> Vec<Arc<NetworkConfig>> {
        let mut networks: Vec<Arc<NetworkConfig>> =
            self.networks.read().values().cloned().collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }

    /// Lease for `identity` in the network called `network`. None for an
    /// unknown network, an empty identity or an exhausted pool.
    pub fn new_lease_for(&self, identity: &str, alias: &str, network: &str) -> Option<Arc<Lease>> {
        let network = self.get(network)?;
        self.leases.new_lease_as(identity, alias, &network.range())
    }
}
