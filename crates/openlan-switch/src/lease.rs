//! Address leases for points.
//!
//! Two indexes, identity to lease and address to lease, share the same
//! records under one lock so they can never disagree.

use crate::error::{Result, SwitchError};
use openlan_types::AddressRange;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a lease came to exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    /// Allocated from a range on demand; freed by release.
    #[default]
    Dynamic,
    /// Reserved by configuration; survives release.
    Static,
}

/// One address assigned to one point identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Point UUID.
    pub identity: String,
    /// Display name, defaults to the identity.
    pub alias: String,
    /// Assigned address.
    pub address: Ipv4Addr,
    #[serde(default)]
    pub kind: LeaseKind,
}

#[derive(Default)]
struct Indexes {
    by_identity: HashMap<String, Arc<Lease>>,
    by_address: HashMap<Ipv4Addr, Arc<Lease>>,
}

impl Indexes {
    fn insert(&mut self, lease: Lease) -> Arc<Lease> {
        let lease = Arc::new(lease);
        self.by_identity
            .insert(lease.identity.clone(), Arc::clone(&lease));
        self.by_address.insert(lease.address, Arc::clone(&lease));
        lease
    }
}

/// Lease table of the switch.
#[derive(Default)]
pub struct LeaseAllocator {
    indexes: RwLock<Indexes>,
}

impl LeaseAllocator {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lease of `identity`, allocating the lowest free address
    /// of `range` on first use. None if the identity is empty or the range
    /// has no free address.
    pub fn new_lease(&self, identity: &str, range: &AddressRange) -> Option<Arc<Lease>> {
        self.new_lease_as(identity, identity, range)
    }

    /// Like [`LeaseAllocator::new_lease`], recording `alias` on a new lease.
    pub fn new_lease_as(
        &self,
        identity: &str,
        alias: &str,
        range: &AddressRange,
    ) -> Option<Arc<Lease>> {
        if identity.is_empty() {
            return None;
        }

        let mut indexes = self.indexes.write();
        if let Some(lease) = indexes.by_identity.get(identity) {
            return Some(Arc::clone(lease));
        }

        let Some(address) = range
            .iter()
            .find(|addr| !indexes.by_address.contains_key(addr))
        else {
            warn!(identity, range = %range, "address pool exhausted");
            return None;
        };

        info!(identity, %address, "lease allocated");
        let alias = if alias.is_empty() { identity } else { alias };
        Some(indexes.insert(Lease {
            identity: identity.to_string(),
            alias: alias.to_string(),
            address,
            kind: LeaseKind::Dynamic,
        }))
    }

    /// Lease held by `identity`.
    pub fn get_lease(&self, identity: &str) -> Option<Arc<Lease>> {
        self.indexes.read().by_identity.get(identity).cloned()
    }

    /// Lease whose alias is `alias`; the lowest address wins if several
    /// share it.
    pub fn get_lease_by_alias(&self, alias: &str) -> Option<Arc<Lease>> {
        self.indexes
            .read()
            .by_identity
            .values()
            .filter(|lease| lease.alias == alias)
            .min_by_key(|lease| lease.address)
            .cloned()
    }

    /// Lease occupying `address`.
    pub fn get_lease_by_address(&self, address: Ipv4Addr) -> Option<Arc<Lease>> {
        self.indexes.read().by_address.get(&address).cloned()
    }

    /// Releases the dynamic lease of `identity` and returns it.
    ///
    /// Static leases stay. The address entry is removed only while it
    /// still belongs to `identity`.
    pub fn release_lease(&self, identity: &str) -> Option<Arc<Lease>> {
        let mut indexes = self.indexes.write();
        let lease = indexes.by_identity.get(identity).cloned()?;
        if lease.kind == LeaseKind::Static {
            debug!(identity, address = %lease.address, "static lease kept");
            return None;
        }
        indexes.by_identity.remove(identity);

        let owned = indexes
            .by_address
            .get(&lease.address)
            .is_some_and(|holder| holder.identity == identity && holder.kind == LeaseKind::Dynamic);
        if owned {
            indexes.by_address.remove(&lease.address);
        }

        info!(identity, address = %lease.address, "lease released");
        Some(lease)
    }

    /// Pins `address` to `identity`.
    ///
    /// Fails if another identity holds the address. A previous lease of
    /// the same identity is replaced.
    pub fn add_static(&self, identity: &str, alias: &str, address: Ipv4Addr) -> Result<Arc<Lease>> {
        if identity.is_empty() {
            return Err(SwitchError::config("static lease needs an identity"));
        }

        let mut indexes = self.indexes.write();
        if let Some(holder) = indexes.by_address.get(&address) {
            if holder.identity != identity {
                return Err(SwitchError::AddressConflict {
                    address,
                    holder: holder.identity.clone(),
                });
            }
        }

        if let Some(previous) = indexes.by_identity.remove(identity) {
            let owned = indexes
                .by_address
                .get(&previous.address)
                .is_some_and(|holder| holder.identity == identity);
            if owned {
                indexes.by_address.remove(&previous.address);
            }
        }

        info!(identity, %address, "static lease added");
        let alias = if alias.is_empty() { identity } else { alias };
        Ok(indexes.insert(Lease {
            identity: identity.to_string(),
            alias: alias.to_string(),
            address,
            kind: LeaseKind::Static,
        }))
    }

    /// Leases sorted by address.
    pub fn list(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .indexes
            .read()
            .by_address
            .values()
            .map(|lease| Lease::clone(lease))
            .collect();
        leases.sort_by_key(|lease| lease.address);
        leases
    }

    /// Copy of the table for persistence.
    pub fn snapshot(&self) -> Vec<Lease> {
        self.list()
    }

    /// Loads saved leases, skipping entries that clash with the current
    /// table. Returns the number restored.
    pub fn restore(&self, leases: Vec<Lease>) -> usize {
        let mut indexes = self.indexes.write();
        let mut restored = 0;
        for lease in leases {
            if lease.identity.is_empty()
                || indexes.by_identity.contains_key(&lease.identity)
                || indexes.by_address.contains_key(&lease.address)
            {
                warn!(identity = %lease.identity, address = %lease.address, "skipping conflicting lease");
                continue;
            }
            indexes.insert(lease);
            restored += 1;
        }
        restored
    }

    /// Number of leases.
    pub fn len(&self) -> usize {
        self.indexes.read().by_identity.len()
    }

    /// Returns true if no lease exists.
    pub fn is_empty(&self) -> bool {
        self.indexes.read().by_identity.is_empty()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let indexes = self.indexes.read();
        for (identity, lease) in &indexes.by_identity {
            assert_eq!(&lease.identity, identity);
            let by_addr = indexes
                .by_address
                .get(&lease.address)
                .expect("address indexed");
            assert!(Arc::ptr_eq(lease, by_addr));
        }
        for (address, lease) in &indexes.by_address {
            assert_eq!(&lease.address, address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn range() -> AddressRange {
        AddressRange::parse("10.0.0.2", "10.0.0.3")
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_allocates_in_order_until_exhausted() {
        let leases = LeaseAllocator::new();
        assert_eq!(leases.new_lease("u1", &range()).unwrap().address, addr("10.0.0.2"));
        assert_eq!(leases.new_lease("u2", &range()).unwrap().address, addr("10.0.0.3"));
        assert!(leases.new_lease("u3", &range()).is_none());
        assert_eq!(leases.len(), 2);
        leases.assert_consistent();
    }

    #[test]
    fn test_new_lease_is_idempotent() {
        let leases = LeaseAllocator::new();
        let first = leases.new_lease("u1", &range()).unwrap();
        let again = leases.new_lease("u1", &range()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(leases.len(), 1);
    }

    #[test]
    fn test_empty_identity_or_range() {
        let leases = LeaseAllocator::new();
        assert!(leases.new_lease("", &range()).is_none());
        assert!(leases
            .new_lease("u1", &AddressRange::parse("bad", "10.0.0.3"))
            .is_none());
        assert!(leases.is_empty());
    }

    #[test]
    fn test_release_frees_address_for_reuse() {
        let leases = LeaseAllocator::new();
        leases.new_lease("u1", &range());
        leases.new_lease("u2", &range());

        let released = leases.release_lease("u1").unwrap();
        assert_eq!(released.address, addr("10.0.0.2"));
        assert!(leases.get_lease("u1").is_none());

        let reused = leases.new_lease("u3", &range()).unwrap();
        assert_eq!(reused.address, addr("10.0.0.2"));
        leases.assert_consistent();
    }

    #[test]
    fn test_release_static_is_noop() {
        let leases = LeaseAllocator::new();
        leases.add_static("u1", "gw", addr("10.0.0.2")).unwrap();

        assert!(leases.release_lease("u1").is_none());
        assert_eq!(leases.get_lease("u1").unwrap().address, addr("10.0.0.2"));
        assert_eq!(
            leases.get_lease_by_address(addr("10.0.0.2")).unwrap().identity,
            "u1"
        );

        // dynamic allocation skips the reserved address
        assert_eq!(leases.new_lease("u2", &range()).unwrap().address, addr("10.0.0.3"));
    }

    #[test]
    fn test_stale_release_keeps_new_holder() {
        let leases = LeaseAllocator::new();
        leases.new_lease("u1", &range());

        // address reassigned by an operator while u1's record lingers
        {
            let mut indexes = leases.indexes.write();
            let taken = Lease {
                identity: "u9".into(),
                alias: "u9".into(),
                address: addr("10.0.0.2"),
                kind: LeaseKind::Dynamic,
            };
            let taken = Arc::new(taken);
            indexes.by_address.insert(taken.address, Arc::clone(&taken));
            indexes.by_identity.insert("u9".into(), taken);
        }

        leases.release_lease("u1");
        assert!(leases.get_lease("u1").is_none());
        assert_eq!(
            leases.get_lease_by_address(addr("10.0.0.2")).unwrap().identity,
            "u9"
        );
    }

    #[test]
    fn test_release_unknown_identity() {
        let leases = LeaseAllocator::new();
        assert!(leases.release_lease("nobody").is_none());
    }

    #[test]
    fn test_static_conflict() {
        let leases = LeaseAllocator::new();
        leases.new_lease("u1", &range());

        let err = leases.add_static("u2", "", addr("10.0.0.2")).unwrap_err();
        assert!(matches!(err, SwitchError::AddressConflict { ref holder, .. } if holder == "u1"));

        // re-pinning your own dynamic address is fine
        let lease = leases.add_static("u1", "", addr("10.0.0.2")).unwrap();
        assert_eq!(lease.kind, LeaseKind::Static);
        leases.assert_consistent();
    }

    #[test]
    fn test_static_moves_identity() {
        let leases = LeaseAllocator::new();
        leases.new_lease("u1", &range());
        leases.add_static("u1", "", addr("10.0.0.9")).unwrap();

        assert!(leases.get_lease_by_address(addr("10.0.0.2")).is_none());
        assert_eq!(leases.len(), 1);
        leases.assert_consistent();
    }

    #[test]
    fn test_lookup_by_alias() {
        let leases = LeaseAllocator::new();
        leases.new_lease_as("u1", "alice", &range());
        leases.new_lease_as("u2", "bob", &range());

        assert_eq!(leases.get_lease_by_alias("bob").unwrap().identity, "u2");
        assert!(leases.get_lease_by_alias("carol").is_none());
        assert_eq!(leases.get_lease("u1").unwrap().alias, "alice");
    }

    #[test]
    fn test_snapshot_and_restore() {
        let leases = LeaseAllocator::new();
        leases.new_lease("u2", &range());
        leases.add_static("u1", "gw", addr("10.0.0.1")).unwrap();

        let saved = leases.snapshot();
        assert_eq!(saved[0].address, addr("10.0.0.1"));
        assert_eq!(saved[1].address, addr("10.0.0.2"));

        let json = serde_json::to_string(&saved).unwrap();
        assert!(json.contains(r#""address":"10.0.0.1""#));
        assert!(json.contains(r#""kind":"static""#));

        let fresh = LeaseAllocator::new();
        fresh.new_lease("other", &range());
        let restored = fresh.restore(serde_json::from_str(&json).unwrap());
        // u2's 10.0.0.2 is now taken by "other"
        assert_eq!(restored, 1);
        assert_eq!(fresh.get_lease("u1").unwrap().kind, LeaseKind::Static);
        fresh.assert_consistent();
    }
}
