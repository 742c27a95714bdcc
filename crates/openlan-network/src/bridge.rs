//! Software Ethernet bridge.
//!
//! Ports inject frames through [`Bridge::input`]; a single forwarding task
//! drains the bounded ingress queue, unicasting to learned ports and
//! flooding everything else. A second task ages the learning table.

use crate::error::{NetworkError, Result};
use crate::learner::{self, LearnEntry, LearnOutcome, LearningTable};
use crate::port::{Frame, Ingress, Port, ETHERNET_HEADER_LEN};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

fn default_name() -> String {
    "default".to_string()
}

fn default_ingress_capacity() -> usize {
    32768
}

fn default_aging_interval() -> u64 {
    5
}

fn default_aging_timeout() -> u64 {
    300
}

fn default_flush_on_detach() -> bool {
    true
}

/// Bridge settings, usually read from the `[bridge]` table of the switch
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge name, used in logs and errors.
    #[serde(default = "default_name")]
    pub name: String,

    /// Depth of the ingress queue; `input` waits when it is full.
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,

    /// Seconds between aging cycles.
    #[serde(default = "default_aging_interval")]
    pub aging_interval: u64,

    /// Seconds a learner may stay idle before it is removed.
    #[serde(default = "default_aging_timeout")]
    pub aging_timeout: u64,

    /// Drop a port's learners as soon as it is detached.
    #[serde(default = "default_flush_on_detach")]
    pub flush_on_detach: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            ingress_capacity: default_ingress_capacity(),
            aging_interval: default_aging_interval(),
            aging_timeout: default_aging_timeout(),
            flush_on_detach: default_flush_on_detach(),
        }
    }
}

impl BridgeConfig {
    /// Creates the default configuration under another name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Rejects values the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(NetworkError::InvalidConfig("name must not be empty".into()));
        }
        if self.ingress_capacity == 0 {
            return Err(NetworkError::InvalidConfig(
                "ingress_capacity must be greater than 0".into(),
            ));
        }
        if self.aging_interval == 0 {
            return Err(NetworkError::InvalidConfig(
                "aging_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Aging timer period.
    pub fn aging_interval(&self) -> Duration {
        Duration::from_secs(self.aging_interval)
    }

    /// Learner idle timeout.
    pub fn aging_timeout(&self) -> Duration {
        Duration::from_secs(self.aging_timeout)
    }
}

/// Point-in-time copy of the bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub frames_in: u64,
    pub short_frames: u64,
    pub unicast: u64,
    pub flooded: u64,
    pub delivered: u64,
    pub delivery_errors: u64,
    pub learned: u64,
    pub aged: u64,
}

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    short_frames: AtomicU64,
    unicast: AtomicU64,
    flooded: AtomicU64,
    delivered: AtomicU64,
    delivery_errors: AtomicU64,
    learned: AtomicU64,
    aged: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            short_frames: self.short_frames.load(Ordering::Relaxed),
            unicast: self.unicast.load(Ordering::Relaxed),
            flooded: self.flooded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            learned: self.learned.load(Ordering::Relaxed),
            aged: self.aged.load(Ordering::Relaxed),
        }
    }
}

/// A learning Ethernet bridge.
pub struct Bridge {
    config: BridgeConfig,
    ports: RwLock<HashMap<String, Arc<dyn Port>>>,
    learners: LearningTable,
    counters: Counters,
    ingress: mpsc::Sender<Frame>,
    pending: Mutex<Option<mpsc::Receiver<Frame>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Creates a stopped bridge. Frames passed to `input` queue up until
    /// [`Bridge::open`] starts the forwarding task.
    pub fn new(config: BridgeConfig) -> Self {
        let (ingress, pending) = mpsc::channel(config.ingress_capacity.max(1));
        let learners = LearningTable::new(config.aging_timeout());
        Self {
            config,
            ports: RwLock::new(HashMap::new()),
            learners,
            counters: Counters::default(),
            ingress,
            pending: Mutex::new(Some(pending)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bridge name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Active configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Spawns the forwarding and aging tasks. Calling it again is a no-op.
    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn open(self: &Arc<Self>) {
        let Some(rx) = self.pending.lock().take() else {
            debug!("bridge already open");
            return;
        };

        let forwarder = tokio::spawn(Arc::clone(self).run_forwarder(rx));
        let aging = tokio::spawn(Arc::clone(self).run_aging());
        self.tasks.lock().extend([forwarder, aging]);
        info!(
            capacity = self.config.ingress_capacity,
            interval = self.config.aging_interval,
            timeout = self.config.aging_timeout,
            "bridge opened"
        );
    }

    /// Stops both tasks and waits for them. The frame being forwarded when
    /// the stop arrives is still delivered; queued frames are discarded and
    /// later `input` calls fail with [`NetworkError::BridgeClosed`].
    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub async fn close(&self) {
        self.cancel.cancel();
        self.pending.lock().take();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "bridge task ended abnormally");
            }
        }
        info!("bridge closed");
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Registers `port` under its name, replacing any port of that name.
    #[instrument(skip(self, port), fields(bridge = %self.config.name, port = port.name()))]
    pub fn attach(&self, port: Arc<dyn Port>) {
        let name = port.name().to_string();
        let replaced = self.ports.write().insert(name.clone(), port.clone());
        match replaced {
            Some(old) if !Arc::ptr_eq(&old, &port) => {
                // learners still point at the old object
                let flushed = self.learners.flush_port(&name);
                info!(flushed, "port replaced");
            }
            Some(_) => debug!("port already attached"),
            None => info!("port attached"),
        }
    }

    /// Unregisters the port called `name` and returns it.
    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn detach(&self, name: &str) -> Option<Arc<dyn Port>> {
        let removed = self.ports.write().remove(name);
        if removed.is_none() {
            debug!(port = name, "detach of unknown port");
            return None;
        }

        if self.config.flush_on_detach {
            let flushed = self.learners.flush_port(name);
            info!(port = name, flushed, "port detached");
        } else {
            info!(port = name, "port detached");
        }
        removed
    }

    /// Learns the frame's source and queues it for forwarding.
    ///
    /// Waits while the ingress queue is full. Fails only once the bridge is
    /// closed. Frames shorter than an Ethernet header are dropped.
    pub async fn input(&self, frame: Frame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(NetworkError::bridge_closed(&self.config.name));
        }

        if frame.payload.len() < ETHERNET_HEADER_LEN {
            Counters::bump(&self.counters.short_frames);
            warn!(
                bridge = %self.config.name,
                port = frame.source_name(),
                len = frame.payload.len(),
                "dropping short frame"
            );
            return Ok(());
        }

        Counters::bump(&self.counters.frames_in);
        if let (Some(source), Some(mac)) = (frame.source.as_ref(), frame.source_mac()) {
            if self.learners.learn(mac, source) == LearnOutcome::Learned {
                Counters::bump(&self.counters.learned);
            }
        }

        self.ingress
            .send(frame)
            .await
            .map_err(|_| NetworkError::bridge_closed(&self.config.name))
    }

    /// Delivers the frame to its resolved destination port.
    pub async fn output(&self, frame: &Frame) -> Result<()> {
        let Some(dest) = frame.dest.as_ref() else {
            return Err(NetworkError::malformed("frame has no destination port"));
        };

        match dest.deliver(&frame.payload).await {
            Ok(()) => {
                Counters::bump(&self.counters.delivered);
                Ok(())
            }
            Err(e) => {
                Counters::bump(&self.counters.delivery_errors);
                warn!(
                    bridge = %self.config.name,
                    port = dest.name(),
                    error = %e,
                    "delivery failed"
                );
                Err(e)
            }
        }
    }

    /// Unicasts to the learned port of the destination, or floods.
    pub async fn forward(&self, frame: Frame) {
        let Some(dst) = frame.dest_mac() else {
            return;
        };

        if let Some(port) = self.learners.lookup(&dst) {
            if !frame.is_from(&port) {
                Counters::bump(&self.counters.unicast);
                debug!(mac = %dst.key(), port = port.name(), "unicast");
                // failure already counted and logged by output
                let _ = self.output(&frame.with_dest(port)).await;
                return;
            }
        }

        self.flood(frame).await;
    }

    async fn flood(&self, frame: Frame) {
        let targets: Vec<Arc<dyn Port>> = self
            .ports
            .read()
            .values()
            .filter(|port| !frame.is_from(port))
            .cloned()
            .collect();

        Counters::bump(&self.counters.flooded);
        debug!(source = frame.source_name(), targets = targets.len(), "flood");
        for port in targets {
            let _ = self.output(&frame.clone().with_dest(port)).await;
        }
    }

    /// Sorted names of the attached ports.
    pub fn ports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Port registered as `name`.
    pub fn port(&self, name: &str) -> Option<Arc<dyn Port>> {
        self.ports.read().get(name).cloned()
    }

    /// Sorted snapshot of the learning table.
    pub fn learners(&self) -> Vec<LearnEntry> {
        self.learners.snapshot()
    }

    /// Learning table of this bridge.
    pub fn learning_table(&self) -> &LearningTable {
        &self.learners
    }

    /// Current counters.
    pub fn stats(&self) -> BridgeStats {
        self.counters.snapshot()
    }

    async fn run_forwarder(self: Arc<Self>, mut rx: mpsc::Receiver<Frame>) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            self.forward(frame).await;
        }
        rx.close();
        debug!(bridge = %self.config.name, "forwarder stopped");
    }

    async fn run_aging(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.aging_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.learners.expire(learner::now());
                    if removed > 0 {
                        self.counters.aged.fetch_add(removed as u64, Ordering::Relaxed);
                        debug!(bridge = %self.config.name, removed, "aging cycle");
                    }
                }
            }
        }
        debug!(bridge = %self.config.name, "aging stopped");
    }
}

#[async_trait]
impl Ingress for Bridge {
    async fn input(&self, frame: Frame) -> Result<()> {
        Bridge::input(self, frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::testing::{ethernet, RecordingPort};
    use pretty_assertions::assert_eq;

    fn bridge() -> Bridge {
        Bridge::new(BridgeConfig::named("br-test"))
    }

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.ingress_capacity, 32768);
        assert_eq!(config.aging_interval(), Duration::from_secs(5));
        assert_eq!(config.aging_timeout(), Duration::from_secs(300));
        assert!(config.flush_on_detach);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate() {
        let mut config = BridgeConfig::default();
        config.ingress_capacity = 0;
        assert!(config.validate().is_err());

        let config = BridgeConfig::named("");
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_reattach_forgets_learners_of_old_port() {
        let bridge = bridge();
        let old_a = RecordingPort::new("a");
        let b = RecordingPort::new("b");
        bridge.attach(old_a.clone());
        bridge.attach(b.clone());

        let old_port: Arc<dyn Port> = old_a.clone();
        bridge
            .learning_table()
            .learn("020000000001".parse().unwrap(), &old_port);

        let new_a = RecordingPort::new("a");
        bridge.attach(new_a.clone());
        assert!(bridge.learning_table().is_empty());

        let from_b: Arc<dyn Port> = b.clone();
        let frame = Frame::new(ethernet("020000000001", "020000000002", 3), Some(from_b));
        bridge.forward(frame).await;

        assert_eq!(new_a.count(), 1);
        assert_eq!(old_a.count(), 0);
    }

    #[test]
    fn test_learn_rebinds_to_new_port_object() {
        let table = LearningTable::new(Duration::from_secs(300));
        let mac: openlan_types::MacAddress = "020000000001".parse().unwrap();
        let first: Arc<dyn Port> = RecordingPort::new("a");
        let second: Arc<dyn Port> = RecordingPort::new("a");

        table.learn(mac, &first);
        assert_eq!(table.learn(mac, &second), LearnOutcome::Refreshed);
        let bound = table.lookup(&mac).unwrap();
        assert!(Arc::ptr_eq(&bound, &second));
    }

    #[test]
    fn test_attach_replaces_by_name() {
        let bridge = bridge();
        bridge.attach(RecordingPort::new("a"));
        bridge.attach(RecordingPort::new("a"));
        bridge.attach(RecordingPort::new("b"));
        assert_eq!(bridge.ports(), vec!["a", "b"]);

        assert!(bridge.detach("a").is_some());
        assert!(bridge.detach("a").is_none());
        assert_eq!(bridge.ports(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_forward_unicast_to_learned_port() {
        let bridge = bridge();
        let a = RecordingPort::new("a");
        let b = RecordingPort::new("b");
        let c = RecordingPort::new("c");
        bridge.attach(a.clone());
        bridge.attach(b.clone());
        bridge.attach(c.clone());

        let a_port: Arc<dyn Port> = a.clone();
        bridge
            .learning_table()
            .learn("020000000001".parse().unwrap(), &a_port);

        let from_b: Arc<dyn Port> = b.clone();
        let frame = Frame::new(ethernet("020000000001", "020000000002", 7), Some(from_b));
        bridge.forward(frame).await;

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 0);
        assert_eq!(c.count(), 0);
        assert_eq!(bridge.stats().unicast, 1);
    }

    #[tokio::test]
    async fn test_learned_on_source_port_floods() {
        let bridge = bridge();
        let a = RecordingPort::new("a");
        let b = RecordingPort::new("b");
        bridge.attach(a.clone());
        bridge.attach(b.clone());

        let a_port: Arc<dyn Port> = a.clone();
        bridge
            .learning_table()
            .learn("020000000001".parse().unwrap(), &a_port);

        let frame = Frame::new(ethernet("020000000001", "020000000003", 1), Some(a_port));
        bridge.forward(frame).await;

        assert_eq!(a.count(), 0);
        assert_eq!(b.count(), 1);
        assert_eq!(bridge.stats().flooded, 1);
    }

    #[tokio::test]
    async fn test_delivery_error_keeps_flooding_and_port() {
        let bridge = bridge();
        let bad = RecordingPort::failing("bad");
        let good = RecordingPort::new("good");
        bridge.attach(bad.clone());
        bridge.attach(good.clone());

        bridge
            .forward(Frame::new(ethernet("ffffffffffff", "020000000001", 1), None))
            .await;

        assert_eq!(good.count(), 1);
        assert_eq!(bridge.ports(), vec!["bad", "good"]);
        let stats = bridge.stats();
        assert_eq!(stats.delivery_errors, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_output_requires_destination() {
        let bridge = bridge();
        let frame = Frame::new(ethernet("ffffffffffff", "020000000001", 1), None);
        assert!(matches!(
            bridge.output(&frame).await,
            Err(NetworkError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_short_frame_dropped() {
        let bridge = bridge();
        let a = RecordingPort::new("a");
        bridge.attach(a.clone());

        let source: Arc<dyn Port> = a;
        bridge
            .input(Frame::new(vec![0u8; 10], Some(source)))
            .await
            .unwrap();

        let stats = bridge.stats();
        assert_eq!(stats.short_frames, 1);
        assert_eq!(stats.frames_in, 0);
        assert!(bridge.learners().is_empty());
    }

    #[tokio::test]
    async fn test_detach_flushes_learners() {
        let bridge = bridge();
        let a = RecordingPort::new("a");
        bridge.attach(a.clone());

        let source: Arc<dyn Port> = a;
        bridge
            .input(Frame::new(ethernet("ffffffffffff", "020000000001", 1), Some(source)))
            .await
            .unwrap();
        assert_eq!(bridge.learners().len(), 1);

        bridge.detach("a");
        assert!(bridge.learners().is_empty());
    }

    #[tokio::test]
    async fn test_detach_without_flush_keeps_learners() {
        let mut config = BridgeConfig::named("br-lazy");
        config.flush_on_detach = false;
        let bridge = Bridge::new(config);
        let a = RecordingPort::new("a");
        bridge.attach(a.clone());

        let source: Arc<dyn Port> = a;
        bridge
            .input(Frame::new(ethernet("ffffffffffff", "020000000001", 1), Some(source)))
            .await
            .unwrap();

        bridge.detach("a");
        assert_eq!(bridge.learners().len(), 1);
    }
}
