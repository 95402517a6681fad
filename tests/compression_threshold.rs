//! A per-topic gzip config with `min_size` set to one
//! byte past a ten-message batch. Ten short identical messages land just
//! under the threshold and go out uncompressed; adding one byte to a single
//! message tips the same batch size over it and gzip kicks in, with the
//! logical message count unchanged.

use std::sync::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use kafka_relay::anomaly::AnomalyTracker;
use kafka_relay::config::test_config;
use kafka_relay::config::Bound;
use kafka_relay::config::BrokerAddr;
use kafka_relay::config::CompressionNamedConfig;
use kafka_relay::config::CompressionType;
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
fn crossing_min_size_switches_uncompressed_batch_to_gzip() {
    let observed: Arc<Mutex<Vec<(usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let observed_clone = observed.clone();
    let broker = FakeBroker::start(move |req| {
        for topic in &req.topics {
            for partition in &topic.partitions {
                observed_clone.lock().unwrap().push((partition.message_count, partition.compressed));
            }
        }
        ack_all(req)
    });
    let broker_port = broker.addr.port();

    let control = FakeControlBroker::start(move |request| match request.get("kind").and_then(|v| v.as_str()) {
        Some("metadata") => serde_json::to_vec(&WireMetadataResponse {
            brokers: vec![WireMetadataBroker { id: 1, host: "127.0.0.1".into(), port: broker_port }],
            topics: vec![WireMetadataTopic {
                name: "t".into(),
                partitions: vec![WireMetadataPartition { id: 0, leader_broker_id: 1, error_code: 0 }],
            }],
        })
        .unwrap(),
        _ => serde_json::to_vec(&serde_json::json!({"outcome": "fail"})).unwrap(),
    });

    let mut config = test_config();
    config.initial_brokers = vec![BrokerAddr { host: "127.0.0.1".into(), port: control.addr.port() }];
    config.batch_default.max_messages = Bound::Value(10);
    config.batch_default.max_time_ms = Bound::Disable(kafka_relay::config::DisableTag::Disable);
    config.batch_default.max_bytes = Bound::Disable(kafka_relay::config::DisableTag::Disable);
    config.compression_default = Some(CompressionNamedConfig { kind: CompressionType::Gzip, min_size: 141, level: None });

    let (input_tx, input_rx) = crossbeam_channel::unbounded();
    let shutdown_button = PushButton::new();
    let anomaly = Arc::new(AnomalyTracker::new(Duration::from_secs(60), 64));

    let router = Router::new(config, Arc::new(FakeWire::default()), test_logger(), anomaly, input_rx, shutdown_button.clone());
    let handle = thread::spawn(move || router.run());

    for _ in 0..10 {
        input_tx.send(Message::new("t".into(), None, b"hi".to_vec(), 0, RoutingType::AnyPartition)).unwrap();
    }
    wait_for(&observed, 1);
    for i in 0..10 {
        let value = if i == 0 { b"hii".to_vec() } else { b"hi".to_vec() };
        input_tx.send(Message::new("t".into(), None, value, 0, RoutingType::AnyPartition)).unwrap();
    }
    wait_for(&observed, 2);

    let snapshot = observed.lock().unwrap().clone();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0], (10, false), "140 bytes stays under the 141-byte min_size");
    assert_eq!(snapshot[1], (10, true), "141 bytes crosses the threshold and compresses");

    let ratio = kafka_relay::metrics::COMPRESSION_SAVINGS_RATIO.with_label_values(&["t"]).get();
    assert!(ratio > 0.0 && ratio < 1.0, "gzip should shrink ten repeated short messages, got ratio {ratio}");

    drop(input_tx);
    shutdown_button.push();
    let outcome = handle.join().expect("router thread should not panic");
    assert!(outcome.ok_shutdown);
}

fn wait_for(observed: &Arc<Mutex<Vec<(usize, bool)>>>, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while observed.lock().unwrap().len() < count && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(observed.lock().unwrap().len(), count, "timed out waiting for {count} produce request(s)");
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
