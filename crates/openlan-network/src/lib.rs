//! OpenLAN data plane.
//!
//! A [`Bridge`] switches Ethernet frames between [`Port`]s: it learns the
//! port behind every unicast source MAC, forwards known destinations
//! directly and floods the rest. Tunnel endpoints on both sides of a link
//! speak the framing in [`wire`].

mod bridge;
mod error;
mod learner;
mod port;
pub mod wire;

pub use bridge::{Bridge, BridgeConfig, BridgeStats};
pub use error::{NetworkError, Result};
pub use learner::{LearnEntry, LearnOutcome, LearningTable, Stale};
pub use port::{same_port, Frame, Ingress, Port, ETHERNET_HEADER_LEN};
