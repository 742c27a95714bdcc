//! OpenLAN switch.
//!
//! Points connect over TCP, log in with a local account and receive an
//! address lease from their network. Authenticated tunnels become ports
//! of one learning [`openlan_network::Bridge`].

mod config;
mod error;
mod lease;
mod network;
pub mod persist;
mod server;
mod switch;
mod users;

pub use config::SwitchConfig;
pub use error::{Result, SwitchError};
pub use lease::{Lease, LeaseAllocator, LeaseKind};
pub use network::{NetworkConfig, NetworkRegistry, StaticLease};
pub use server::{ServerOptions, Session, SessionInfo, TunnelServer};
pub use switch::Switch;
pub use users::{Authenticator, User, UserStore, ROLE_GUEST, ROLE_LDAP};
