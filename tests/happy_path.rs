//! End-to-end scenario: four messages to one topic split across two
//! brokers, AnyPartition routing, clean shutdown.
//!
//! Drives the router purely through its public API (`Router::new` +
//! `run()`) against the in-process fake broker, the same way the crate's
//! own `router::tests::end_to_end_produces_a_message_through_bootstrap_and_dispatch`
//! drives it from inside the crate.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use kafka_relay::anomaly::AnomalyTracker;
use kafka_relay::config::test_config;
use kafka_relay::config::BrokerAddr;
use kafka_relay::config::Bound;
use kafka_relay::message::Message;
use kafka_relay::message::RoutingType;
use kafka_relay::router::Router;
use kafka_relay::sync::PushButton;
use kafka_relay::test_support::fake_broker::ack_all;
use kafka_relay::test_support::fake_broker::FakeBroker;
use kafka_relay::test_support::fake_broker::FakeControlBroker;
use kafka_relay::test_support::fake_broker::FakeWire;
use kafka_relay::test_support::fake_broker::WireMetadataBroker;
use kafka_relay::test_support::fake_broker::WireMetadataPartition;
use kafka_relay::test_support::fake_broker::WireMetadataResponse;
use kafka_relay::test_support::fake_broker::WireMetadataTopic;

#[test]
fn four_messages_two_brokers_clean_shutdown() {
    let seen = Arc::new(AtomicUsize::new(0));

    let seen_a = seen.clone();
    let broker_a = FakeBroker::start(move |req| {
        seen_a.fetch_add(req.topics.iter().map(|t| t.partitions.iter().map(|p| p.message_count).sum::<usize>()).sum(), Ordering::SeqCst);
        ack_all(req)
    });
    let seen_b = seen.clone();
    let broker_b = FakeBroker::start(move |req| {
        seen_b.fetch_add(req.topics.iter().map(|t| t.partitions.iter().map(|p| p.message_count).sum::<usize>()).sum(), Ordering::SeqCst);
        ack_all(req)
    });
    let (port_a, port_b) = (broker_a.addr.port(), broker_b.addr.port());

    let control = FakeControlBroker::start(move |request| match request.get("kind").and_then(|v| v.as_str()) {
        Some("metadata") => serde_json::to_vec(&WireMetadataResponse {
            brokers: vec![
                WireMetadataBroker { id: 1, host: "127.0.0.1".into(), port: port_a },
                WireMetadataBroker { id: 2, host: "127.0.0.1".into(), port: port_b },
            ],
            topics: vec![WireMetadataTopic {
                name: "scooby_doo".into(),
                partitions: vec![
                    WireMetadataPartition { id: 0, leader_broker_id: 1, error_code: 0 },
                    WireMetadataPartition { id: 1, leader_broker_id: 1, error_code: 0 },
                    WireMetadataPartition { id: 2, leader_broker_id: 2, error_code: 0 },
                    WireMetadataPartition { id: 3, leader_broker_id: 2, error_code: 0 },
                ],
            }],
        })
        .unwrap(),
        _ => serde_json::to_vec(&serde_json::json!({"outcome": "fail"})).unwrap(),
    });

    let mut config = test_config();
    config.initial_brokers = vec![BrokerAddr { host: "127.0.0.1".into(), port: control.addr.port() }];
    config.batch_default.max_messages = Bound::Value(1);

    let (input_tx, input_rx) = crossbeam_channel::unbounded();
    let shutdown_button = PushButton::new();
    let anomaly = Arc::new(AnomalyTracker::new(Duration::from_secs(60), 64));

    let router = Router::new(config, Arc::new(FakeWire::default()), test_logger(), anomaly.clone(), input_rx, shutdown_button.clone());
    let handle = thread::spawn(move || router.run());

    for value in ["Scooby", "Shaggy", "Velma", "Daphne"] {
        input_tx
            .send(Message::new("scooby_doo".into(), None, value.as_bytes().to_vec(), 0, RoutingType::AnyPartition))
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(seen.load(Ordering::SeqCst), 4, "all four messages should reach a broker exactly once");

    let snapshot = anomaly.snapshot();
    assert!(snapshot.discards.is_empty(), "no discards expected on the happy path");
    assert_eq!(snapshot.duplicates_by_topic.get("scooby_doo"), None);

    drop(input_tx);
    shutdown_button.push();
    let outcome = handle.join().expect("router thread should not panic");
    assert!(outcome.ok_shutdown);
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
