//! Common OpenLAN value types.
//!
//! These types are shared by the bridge, the tunnel transport and the
//! lease allocator:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC address and its learning key
//! - [`AddressRange`]: inclusive IPv4 range scanned as big-endian integers

mod mac;
mod range;

pub use mac::MacAddress;
pub use range::AddressRange;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IPv4 address: {0}")]
    InvalidIpv4Address(String),

    #[error("frame too short for a MAC address: {0} bytes")]
    ShortFrame(usize),
}
