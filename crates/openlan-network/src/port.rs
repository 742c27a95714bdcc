//! Port capability and the frame record passed through the bridge.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use openlan_types::MacAddress;
use std::fmt;
use std::sync::Arc;

/// Length of an Ethernet II header (destination, source, ethertype).
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Anything that can take injected frames: tunnel sessions, tunnel workers,
/// physical adapters and VXLAN/ESP members.
#[async_trait]
pub trait Port: Send + Sync {
    /// Unique port name, the registration key inside a bridge.
    fn name(&self) -> &str;

    /// Hands one frame to the port.
    ///
    /// Implementations may wait for room in their own outbound queue but
    /// must not wait for the remote side.
    async fn deliver(&self, frame: &[u8]) -> Result<()>;
}

/// The ingress side of a bridge as seen by port adapters.
#[async_trait]
pub trait Ingress: Send + Sync {
    /// Injects a frame received from the outside.
    async fn input(&self, frame: Frame) -> Result<()>;
}

/// Returns true if both references name the same port.
pub fn same_port(a: &Arc<dyn Port>, b: &Arc<dyn Port>) -> bool {
    Arc::ptr_eq(a, b) || a.name() == b.name()
}

/// A frame in transit: raw Ethernet bytes plus the originating and the
/// resolved destination port.
#[derive(Clone)]
pub struct Frame {
    /// Raw Ethernet frame.
    pub payload: Bytes,
    /// Port the frame arrived on, if any.
    pub source: Option<Arc<dyn Port>>,
    /// Direct forward target, set once the destination is known.
    pub dest: Option<Arc<dyn Port>>,
}

impl Frame {
    /// Creates a frame received on `source`.
    pub fn new(payload: impl Into<Bytes>, source: Option<Arc<dyn Port>>) -> Self {
        Self {
            payload: payload.into(),
            source,
            dest: None,
        }
    }

    /// Returns the same frame addressed to `dest`.
    pub fn with_dest(mut self, dest: Arc<dyn Port>) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Destination MAC (bytes 0..6), if the frame is long enough.
    pub fn dest_mac(&self) -> Option<MacAddress> {
        MacAddress::destination_of(&self.payload).ok()
    }

    /// Source MAC (bytes 6..12), if the frame is long enough.
    pub fn source_mac(&self) -> Option<MacAddress> {
        MacAddress::source_of(&self.payload).ok()
    }

    /// Name of the source port, or "-" for locally generated frames.
    pub fn source_name(&self) -> &str {
        self.source.as_ref().map(|p| p.name()).unwrap_or("-")
    }

    /// Returns true if `port` is the port this frame came from.
    pub fn is_from(&self, port: &Arc<dyn Port>) -> bool {
        self.source
            .as_ref()
            .map(|src| same_port(src, port))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.payload.len())
            .field("source", &self.source_name())
            .field("dest", &self.dest.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}
