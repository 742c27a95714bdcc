//! OpenLAN point: the endpoint side of a tunnel.
//!
//! A [`TunnelWorker`] keeps one TCP connection to a switch alive, logs in,
//! and moves Ethernet frames between the local bridge and the switch.

mod config;
mod error;
mod worker;

pub use config::PointConfig;
pub use error::{Result, TunnelError};
pub use worker::{Status, TunnelWorker, WorkerStats};
