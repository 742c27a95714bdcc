//! The switch as one owned object: bridge, networks, accounts, lease table
//! and tunnel listener wired together.

use crate::config::SwitchConfig;
use crate::error::{Result, SwitchError};
use crate::lease::{Lease, LeaseAllocator};
use crate::network::NetworkRegistry;
use crate::persist;
use crate::server::{SessionInfo, TunnelServer};
use crate::users::{Authenticator, UserStore};
use openlan_network::Bridge;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Switch {
    config: SwitchConfig,
    bridge: Arc<Bridge>,
    leases: Arc<LeaseAllocator>,
    networks: Arc<NetworkRegistry>,
    users: Arc<UserStore>,
    users_loaded: AtomicBool,
    server: Arc<TunnelServer>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Switch {
    /// Builds the switch and registers the configured networks.
    pub fn new(config: SwitchConfig) -> Result<Self> {
        config.validate()?;

        let bridge = Arc::new(Bridge::new(config.bridge.clone()));
        let leases = Arc::new(LeaseAllocator::new());
        let networks = Arc::new(NetworkRegistry::new(Arc::clone(&leases)));
        for network in &config.networks {
            networks.add(network.clone())?;
        }
        let users = Arc::new(UserStore::new());
        let auth: Arc<dyn Authenticator> = users.clone();
        let server = Arc::new(TunnelServer::new(
            config.server_options(),
            Arc::clone(&bridge),
            Arc::clone(&networks),
            auth,
        ));

        Ok(Self {
            config,
            bridge,
            leases,
            networks,
            users,
            users_loaded: AtomicBool::new(false),
            server,
            listener: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn leases(&self) -> &Arc<LeaseAllocator> {
        &self.leases
    }

    pub fn networks(&self) -> &Arc<NetworkRegistry> {
        &self.networks
    }

    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    /// Open tunnel sessions.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.server.sessions()
    }

    /// Loads accounts and saved leases. Missing or broken files are logged
    /// and skipped so the switch still comes up.
    pub fn load_state(&self) {
        if let Some(path) = &self.config.users_file {
            match self.users.load(path) {
                Ok(_) => self.users_loaded.store(true, Ordering::Release),
                Err(SwitchError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "no users file yet");
                    self.users_loaded.store(true, Ordering::Release);
                }
                // a broken file is left alone on save
                Err(e) => warn!(path = %path.display(), error = %e, "users not loaded"),
            }
        }

        if let Some(path) = &self.config.leases_file {
            match persist::load_json::<Vec<Lease>>(path) {
                Ok(Some(saved)) => {
                    let restored = self.leases.restore(saved);
                    info!(path = %path.display(), restored, "leases restored");
                }
                Ok(None) => info!(path = %path.display(), "no saved leases"),
                Err(e) => warn!(path = %path.display(), error = %e, "leases not restored"),
            }
        }
    }

    /// Writes accounts and the lease table to their configured files.
    /// Accounts are only written once `load_state` read or created them.
    pub fn save_state(&self) -> Result<()> {
        if let Some(path) = &self.config.users_file {
            if self.users_loaded.load(Ordering::Acquire) {
                self.users.save(path)?;
                info!(path = %path.display(), count = self.users.len(), "users saved");
            }
        }
        if let Some(path) = &self.config.leases_file {
            persist::save_json(path, &self.leases.snapshot())?;
            info!(path = %path.display(), count = self.leases.len(), "leases saved");
        }
        Ok(())
    }

    /// Opens the bridge and starts accepting tunnels. Returns the bound
    /// listen address.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.bridge.open();
        let listener = self.server.bind().await?;
        let addr = listener.local_addr()?;
        let server = Arc::clone(&self.server);
        *self.listener.lock() = Some(tokio::spawn(server.serve(listener)));
        info!(bridge = %self.bridge.name(), %addr, "switch started");
        Ok(addr)
    }

    /// Closes every session, stops the bridge and saves leases.
    pub async fn stop(&self) {
        self.server.shutdown().await;
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(error = %e, "listener task ended abnormally");
            }
        }
        self.bridge.close().await;
        if let Err(e) = self.save_state() {
            warn!(error = %e, "state not saved");
        }
        info!("switch stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::User;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn config_with_users(path: &std::path::Path) -> SwitchConfig {
        SwitchConfig {
            users_file: Some(path.to_path_buf()),
            ..SwitchConfig::default()
        }
    }

    #[test]
    fn test_users_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("password");
        fs::write(&path, "alice:secret:guest\n").unwrap();

        let switch = Switch::new(config_with_users(&path)).unwrap();
        switch.load_state();
        switch.users().add(User::new("bob", "hunter2"));
        switch.save_state().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "alice:secret:guest\nbob:hunter2:guest\n");
    }

    #[test]
    fn test_users_file_created_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("password");

        let switch = Switch::new(config_with_users(&path)).unwrap();
        switch.load_state();
        switch.users().add(User::new("alice", "secret"));
        switch.save_state().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "alice:secret:guest\n");
    }

    #[test]
    fn test_broken_users_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("password");
        fs::write(&path, "broken\n").unwrap();

        let switch = Switch::new(config_with_users(&path)).unwrap();
        switch.load_state();
        assert!(switch.users().is_empty());
        switch.save_state().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "broken\n");
    }
}
