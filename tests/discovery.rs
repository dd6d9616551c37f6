mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use common::FakeBus;
use watts_bridge::discovery::DiscoveryError;
use watts_bridge::{Bridge, BridgeHandle, BridgeOptions};

const PATTERN: &str = "watts/+/measurement";
const FULL: &str = r#"{"positive_active_energy": 1198712, "positive_active_power": 100, "voltage_l1": 230}"#;
const SPARSE: &str = r#"{"positive_active_power": 100}"#;

fn start(bus: &FakeBus) -> BridgeHandle {
    let (bridge, _task) = Bridge::spawn(
        BridgeOptions::default(),
        bus.factory(),
        CancellationToken::new(),
    );
    bridge
}

fn topic(id: &str) -> String {
    format!("watts/{}/measurement", id)
}

#[tokio::test(start_paused = true)]
async fn test_three_topics_then_silence_finalize() {
    let bus = FakeBus::new();
    let bridge = start(&bus);
    bridge.connect().await.unwrap();

    let started = Instant::now();
    let outcome = bridge.start_discovery(BTreeSet::new()).await.unwrap();
    assert!(bus.state().subscribed.contains(&PATTERN.to_string()));

    for id in ["M1", "M2", "M3"] {
        bus.emit(&topic(id), FULL).await;
    }

    let candidates = outcome.complete().await.unwrap();
    let ids: Vec<_> = candidates.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["M1", "M2", "M3"]);
    assert_eq!(candidates[0].name, "Device M1");
    assert_eq!(
        candidates[0].capabilities,
        BTreeSet::from([
            "meter_power.imported".to_string(),
            "measure_power".to_string(),
            "measure_voltage.l1".to_string(),
        ])
    );
    // One tick to notice the topics, two quiet ones to settle
    assert_eq!(started.elapsed(), Duration::from_secs(21));

    let mut status = bridge.subscribe_status();
    status.wait_for(|s| !s.discovering).await.unwrap();
    assert!(bus.state().unsubscribed.contains(&PATTERN.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_late_topic_extends_the_session() {
    let bus = FakeBus::new();
    let bridge = start(&bus);
    bridge.connect().await.unwrap();

    let started = Instant::now();
    let outcome = bridge.start_discovery(BTreeSet::new()).await.unwrap();
    bus.emit(&topic("M1"), FULL).await;
    sleep(Duration::from_secs(10)).await;
    bus.emit(&topic("M2"), FULL).await;

    let candidates = outcome.complete().await.unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(28));
}

#[tokio::test(start_paused = true)]
async fn test_claimed_and_sparse_topics_are_not_candidates() {
    let bus = FakeBus::new();
    let bridge = start(&bus);
    bridge.connect().await.unwrap();

    let (device, mut device_rx) = mpsc::channel(8);
    bridge.register_topic(topic("OWNED"), device).await.unwrap();

    let ignore = BTreeSet::from([topic("SKIP")]);
    let outcome = bridge.start_discovery(ignore).await.unwrap();
    bus.emit(&topic("OWNED"), FULL).await;
    bus.emit(&topic("SKIP"), FULL).await;
    bus.emit(&topic("SPARSE"), SPARSE).await;
    bus.emit(&topic("NEW"), "not json").await;
    bus.emit(&topic("NEW"), FULL).await;

    let candidates = outcome.complete().await.unwrap();
    let ids: Vec<_> = candidates.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["NEW"]);

    // The owning device still got its reading
    assert_eq!(device_rx.recv().await.unwrap().topic, topic("OWNED"));
}

#[tokio::test(start_paused = true)]
async fn test_new_session_abandons_the_previous_one() {
    let bus = FakeBus::new();
    let bridge = start(&bus);
    bridge.connect().await.unwrap();

    let first = bridge.start_discovery(BTreeSet::new()).await.unwrap();
    let second = bridge.start_discovery(BTreeSet::new()).await.unwrap();
    bus.emit(&topic("M1"), FULL).await;

    assert_eq!(first.complete().await, Err(DiscoveryError::Abandoned));
    let candidates = second.complete().await.unwrap();
    assert_eq!(candidates.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_started_offline_subscribes_on_connect() {
    let bus = FakeBus::new();
    let bridge = start(&bus);

    let outcome = bridge.start_discovery(BTreeSet::new()).await.unwrap();
    assert!(bridge.status().discovering);
    bridge.connect().await.unwrap();
    assert_eq!(bus.state().subscribed, vec![PATTERN]);

    bus.emit(&topic("M1"), FULL).await;
    assert_eq!(outcome.complete().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_discovery() {
    let bus = FakeBus::new();
    let bridge = start(&bus);
    bridge.connect().await.unwrap();

    let outcome = bridge.start_discovery(BTreeSet::new()).await.unwrap();
    bridge.shutdown().await.unwrap();
    assert_eq!(outcome.complete().await, Err(DiscoveryError::Abandoned));
}

#[tokio::test(start_paused = true)]
async fn test_empty_bus_finalizes_empty() {
    let bus = FakeBus::new();
    let bridge = start(&bus);
    bridge.connect().await.unwrap();

    let outcome = bridge.start_discovery(BTreeSet::new()).await.unwrap();
    assert_eq!(outcome.complete().await, Ok(Vec::new()));
}
