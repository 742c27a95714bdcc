//! Bridge scenarios driven through the public ingress path with the
//! forwarding and aging tasks running.

use async_trait::async_trait;
use openlan_network::{Bridge, BridgeConfig, Frame, NetworkError, Port};
use openlan_types::MacAddress;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Port that forwards every delivered frame into a channel.
struct ChannelPort {
    name: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelPort {
    fn new(name: &str) -> (Arc<dyn Port>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let port = Arc::new(Self {
            name: name.to_string(),
            tx,
        });
        (port, rx)
    }
}

#[async_trait]
impl Port for ChannelPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, frame: &[u8]) -> openlan_network::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| NetworkError::delivery(&self.name, "receiver gone"))
    }
}

fn ethernet(dst: &str, src: &str, tag: u8) -> Vec<u8> {
    let dst: MacAddress = dst.parse().expect("valid MAC");
    let src: MacAddress = src.parse().expect("valid MAC");
    let mut frame = dst.as_bytes().to_vec();
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&[0x08, 0x00, tag]);
    frame
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("frame delivered")
        .expect("port alive")
}

/// Waits until the forwarder has attempted `deliveries` deliveries.
async fn settle(bridge: &Bridge, deliveries: u64) {
    for _ in 0..100 {
        let stats = bridge.stats();
        if stats.delivered + stats.delivery_errors >= deliveries {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("bridge did not attempt {deliveries} deliveries");
}

#[tokio::test]
async fn test_flood_then_unicast_reply() {
    let bridge = Arc::new(Bridge::new(BridgeConfig::named("br-e2e")));
    bridge.open();

    let (a, mut a_rx) = ChannelPort::new("A");
    let (b, mut b_rx) = ChannelPort::new("B");
    bridge.attach(a.clone());
    bridge.attach(b.clone());

    // A -> unknown destination floods to B only
    let request = ethernet("112233445566", "aabbccddeeff", 1);
    bridge
        .input(Frame::new(request.clone(), Some(a.clone())))
        .await
        .unwrap();
    assert_eq!(next(&mut b_rx).await, request);

    // B -> aabbccddeeff unicasts to A
    let reply = ethernet("aabbccddeeff", "112233445566", 2);
    bridge
        .input(Frame::new(reply.clone(), Some(b.clone())))
        .await
        .unwrap();
    assert_eq!(next(&mut a_rx).await, reply);

    settle(&bridge, 2).await;
    let stats = bridge.stats();
    assert_eq!(stats.flooded, 1);
    assert_eq!(stats.unicast, 1);
    assert!(a_rx.try_recv().is_err());
    assert!(b_rx.try_recv().is_err());

    let keys: Vec<String> = bridge.learners().into_iter().map(|l| l.key).collect();
    assert_eq!(keys, vec!["112233445566", "aabbccddeeff"]);

    bridge.close().await;
}

#[tokio::test]
async fn test_flood_reaches_all_but_source() {
    let bridge = Arc::new(Bridge::new(BridgeConfig::named("br-flood")));
    bridge.open();

    let mut receivers = Vec::new();
    let mut ports = Vec::new();
    for i in 0..5 {
        let (port, rx) = ChannelPort::new(&format!("p{i}"));
        bridge.attach(port.clone());
        ports.push(port);
        receivers.push(rx);
    }

    let frame = ethernet("ffffffffffff", "020000000001", 9);
    bridge
        .input(Frame::new(frame.clone(), Some(ports[0].clone())))
        .await
        .unwrap();
    settle(&bridge, 4).await;

    let delivered: usize = receivers
        .iter_mut()
        .map(|rx| {
            let mut n = 0;
            while rx.try_recv().is_ok() {
                n += 1;
            }
            n
        })
        .sum();
    assert_eq!(delivered, 4);
    assert_eq!(bridge.stats().delivered, 4);

    bridge.close().await;
}

#[tokio::test]
async fn test_per_source_order_is_preserved() {
    let bridge = Arc::new(Bridge::new(BridgeConfig::named("br-order")));
    bridge.open();

    let (a, _a_rx) = ChannelPort::new("A");
    let (b, mut b_rx) = ChannelPort::new("B");
    bridge.attach(a.clone());
    bridge.attach(b);

    for tag in 0..50u8 {
        bridge
            .input(Frame::new(
                ethernet("ffffffffffff", "020000000001", tag),
                Some(a.clone()),
            ))
            .await
            .unwrap();
    }

    for tag in 0..50u8 {
        let frame = next(&mut b_rx).await;
        assert_eq!(frame[14], tag);
    }

    bridge.close().await;
}

#[test]
fn test_attach_detach_replay() {
    let bridge = Bridge::new(BridgeConfig::named("br-replay"));
    let ops: &[(&str, bool)] = &[
        ("a", true),
        ("b", true),
        ("a", false),
        ("c", true),
        ("b", true),
        ("d", false),
        ("a", true),
        ("c", false),
    ];

    for (name, attach) in ops {
        if *attach {
            let (port, _rx) = ChannelPort::new(name);
            bridge.attach(port);
        } else {
            bridge.detach(name);
        }
    }

    assert_eq!(bridge.ports(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_learner_ages_out() {
    let bridge = Arc::new(Bridge::new(BridgeConfig::named("br-aging")));
    bridge.open();

    let (a, _a_rx) = ChannelPort::new("A");
    let (b, _b_rx) = ChannelPort::new("B");
    bridge.attach(a.clone());
    bridge.attach(b.clone());

    bridge
        .input(Frame::new(ethernet("ffffffffffff", "020000000001", 1), Some(a)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(200)).await;
    bridge
        .input(Frame::new(ethernet("ffffffffffff", "020000000002", 1), Some(b)))
        .await
        .unwrap();
    assert_eq!(bridge.learners().len(), 2);

    // first learner idle for 310s, second for 110s
    tokio::time::sleep(Duration::from_secs(110)).await;
    let keys: Vec<String> = bridge.learners().into_iter().map(|l| l.key).collect();
    assert_eq!(keys, vec!["020000000002"]);
    assert_eq!(bridge.stats().aged, 1);

    bridge.close().await;
}

#[tokio::test]
async fn test_input_after_close_fails() {
    let bridge = Arc::new(Bridge::new(BridgeConfig::named("br-closed")));
    bridge.open();
    bridge.close().await;

    let (a, _rx) = ChannelPort::new("A");
    let err = bridge
        .input(Frame::new(ethernet("ffffffffffff", "020000000001", 1), Some(a)))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::BridgeClosed { .. }));
    assert!(!err.is_retryable());
}
