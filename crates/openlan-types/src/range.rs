//! Inclusive IPv4 address range.

use crate::ParseError;
use std::fmt;
use std::net::Ipv4Addr;

/// An inclusive range of IPv4 addresses, scanned as unsigned 32-bit
/// big-endian integers.
///
/// A range built from malformed bounds is empty rather than an error, so a
/// misconfigured network simply never hands out addresses.
///
/// ```
/// use openlan_types::AddressRange;
///
/// let range = AddressRange::parse("10.0.0.2", "10.0.0.3");
/// let addrs: Vec<String> = range.iter().map(|a| a.to_string()).collect();
/// assert_eq!(addrs, ["10.0.0.2", "10.0.0.3"]);
///
/// assert!(AddressRange::parse("bogus", "10.0.0.3").is_empty());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: u32,
    end: u32,
    valid: bool,
}

impl AddressRange {
    /// The empty range.
    pub const EMPTY: AddressRange = AddressRange {
        start: 1,
        end: 0,
        valid: false,
    };

    /// Creates a range from two addresses, inclusive of both.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self {
            start: u32::from(start),
            end: u32::from(end),
            valid: true,
        }
    }

    /// Parses start/end strings; malformed input yields the empty range.
    pub fn parse(start: &str, end: &str) -> Self {
        match (parse_ipv4(start), parse_ipv4(end)) {
            (Ok(s), Ok(e)) => Self::new(s, e),
            _ => Self::EMPTY,
        }
    }

    /// Returns true if no address can be drawn from this range.
    pub fn is_empty(&self) -> bool {
        !self.valid || self.start > self.end
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            u64::from(self.end - self.start) + 1
        }
    }

    /// Returns true if `addr` lies within the range.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        !self.is_empty() && value >= self.start && value <= self.end
    }

    /// Iterates the range in ascending numeric order.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        let (start, end) = if self.is_empty() {
            (1, 0)
        } else {
            (self.start, self.end)
        };
        (start..=end).map(Ipv4Addr::from)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(
                f,
                "{}-{}",
                Ipv4Addr::from(self.start),
                Ipv4Addr::from(self.end)
            )
        }
    }
}

/// Parses a dotted-quad IPv4 address.
pub(crate) fn parse_ipv4(s: &str) -> Result<Ipv4Addr, ParseError> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ParseError::InvalidIpv4Address(s.to_string()))
}
