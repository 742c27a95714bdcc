//! MAC learning table.
//!
//! Maps a source MAC to the port it was last seen on. One write lock guards
//! the whole table, so unrelated ports contend on it; that is a throughput
//! limit only, never a correctness issue.

use crate::port::{same_port, Port};
use openlan_types::MacAddress;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

/// Monotonic clock shared with the aging timer, so paused tokio time in
/// tests drives both.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// What `learn` did with a source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    /// New entry created.
    Learned,
    /// Existing entry refreshed (and moved if the port changed).
    Refreshed,
    /// Group source address, not learned.
    Ignored,
}

struct Learner {
    port: Arc<dyn Port>,
    first_seen: Instant,
    last_seen: Instant,
    first_seen_wall: SystemTime,
}

/// Reporting snapshot of one learning entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LearnEntry {
    /// Lower-hex MAC without separators.
    pub key: String,
    /// Name of the bound port.
    pub port: String,
    /// Unix seconds of the first observation.
    pub first_seen: u64,
    /// Seconds since the last observation.
    pub idle_secs: u64,
}

/// An entry selected for eviction together with the `last_seen` it had
/// when it was selected.
#[derive(Debug, Clone, Copy)]
pub struct Stale {
    /// Learned address.
    pub mac: MacAddress,
    last_seen: Instant,
}

/// The learning table of one bridge.
pub struct LearningTable {
    entries: RwLock<HashMap<MacAddress, Learner>>,
    timeout: Duration,
}

impl LearningTable {
    /// Creates an empty table expiring entries idle for more than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(1024)),
            timeout,
        }
    }

    /// Idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing has been learned.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Records that `mac` was seen on `port`.
    ///
    /// Runs entirely under the write lock so a refresh can never race with
    /// an eviction of the same key.
    pub fn learn(&self, mac: MacAddress, port: &Arc<dyn Port>) -> LearnOutcome {
        self.learn_at(mac, port, now())
    }

    pub(crate) fn learn_at(
        &self,
        mac: MacAddress,
        port: &Arc<dyn Port>,
        now: Instant,
    ) -> LearnOutcome {
        if mac.is_multicast() {
            return LearnOutcome::Ignored;
        }

        let mut entries = self.entries.write();
        if let Some(learner) = entries.get_mut(&mac) {
            learner.last_seen = now;
            if !same_port(&learner.port, port) {
                debug!(mac = %mac.key(), from = learner.port.name(), to = port.name(), "learner moved");
            }
            if !Arc::ptr_eq(&learner.port, port) {
                learner.port = port.clone();
            }
            return LearnOutcome::Refreshed;
        }

        info!(mac = %mac.key(), port = port.name(), "learned");
        entries.insert(
            mac,
            Learner {
                port: port.clone(),
                first_seen: now,
                last_seen: now,
                first_seen_wall: SystemTime::now(),
            },
        );
        LearnOutcome::Learned
    }

    /// Port `mac` was last seen on.
    pub fn lookup(&self, mac: &MacAddress) -> Option<Arc<dyn Port>> {
        self.entries.read().get(mac).map(|l| l.port.clone())
    }

    /// Snapshot of entries idle longer than the timeout at `now`.
    pub fn collect_stale(&self, now: Instant) -> Vec<Stale> {
        self.entries
            .read()
            .iter()
            .filter(|(_, l)| now.saturating_duration_since(l.last_seen) > self.timeout)
            .map(|(mac, l)| Stale {
                mac: *mac,
                last_seen: l.last_seen,
            })
            .collect()
    }

    /// Deletes the snapshotted entries that are still present, unrefreshed
    /// and still stale at `now`. Returns the number removed.
    pub fn remove_stale(&self, stale: &[Stale], now: Instant) -> usize {
        if stale.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write();
        let mut removed = 0;
        for candidate in stale {
            let expired = entries.get(&candidate.mac).is_some_and(|l| {
                l.last_seen == candidate.last_seen
                    && now.saturating_duration_since(l.last_seen) > self.timeout
            });
            if expired {
                entries.remove(&candidate.mac);
                info!(mac = %candidate.mac.key(), "learner aged out");
                removed += 1;
            }
        }
        removed
    }

    /// Runs one aging cycle at `now`.
    pub fn expire(&self, now: Instant) -> usize {
        let stale = self.collect_stale(now);
        self.remove_stale(&stale, now)
    }

    /// Removes every entry bound to the port named `port`.
    pub fn flush_port(&self, port: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, l| l.port.name() != port);
        before - entries.len()
    }

    /// Sorted reporting snapshot.
    pub fn snapshot(&self) -> Vec<LearnEntry> {
        let now = now();
        let mut list: Vec<LearnEntry> = self
            .entries
            .read()
            .iter()
            .map(|(mac, l)| LearnEntry {
                key: mac.key(),
                port: l.port.name().to_string(),
                first_seen: l
                    .first_seen_wall
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default(),
                idle_secs: now.saturating_duration_since(l.last_seen).as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    /// Time the entry for `mac` was first learned.
    pub fn first_seen(&self, mac: &MacAddress) -> Option<Instant> {
        self.entries.read().get(mac).map(|l| l.first_seen)
    }
}
