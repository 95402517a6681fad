//! Thin binary entry point: load config, wire up logging/metrics, construct
//! the router and run it to completion. CLI/config-file parsing beyond a
//! bare path argument, the local IPC input agents, the Kafka wire codec and
//! the signal-handler thread are all out of scope for this crate;
//! this `main` only owns the seam between them and the transit engine.

use std::env;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use slog::Drain;
use slog::Logger;

use kafka_relay::anomaly::AnomalyTracker;
use kafka_relay::config::Config;
use kafka_relay::router::Router;
use kafka_relay::sync::PushButton;

/// Builds the root logger: human-readable term output by default, switching
/// to structured JSON when `KAFKA_RELAYD_LOG_FORMAT=json` is set.
fn build_logger() -> Logger {
    let json = env::var("KAFKA_RELAYD_LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        let drain = slog_json::Json::default(std::io::stdout()).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!("version" => env!("CARGO_PKG_VERSION")))
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!("version" => env!("CARGO_PKG_VERSION")))
    }
}

fn main() {
    let logger = build_logger();

    let config_path = match env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: kafka-relayd <config.yaml>");
            exit(2);
        }
    };
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(error) => {
            slog::error!(logger, "failed to load configuration"; "path" => &config_path, "error" => %error);
            exit(1);
        }
    };

    let registry = prometheus::Registry::new();
    kafka_relay::metrics::register_metrics(&logger, &registry);

    let anomaly = Arc::new(AnomalyTracker::new(
        Duration::from_secs(config.discard_report_interval_s),
        config.bad_msg_prefix_size,
    ));

    // The local IPC input agents (UNIX datagram/stream, TCP) and the
    // process-signal handler are external collaborators: their
    // sender/pusher ends are the integration seam this binary exposes but
    // does not itself populate.
    let (_input_tx, input_rx) = crossbeam_channel::unbounded();
    let shutdown_button = PushButton::new();

    let wire = build_wire(&logger);

    let router = Router::new(config, wire, logger.clone(), anomaly, input_rx, shutdown_button);
    let outcome = router.run();
    slog::info!(logger, "router stopped"; "ok_shutdown" => outcome.ok_shutdown);
    exit(if outcome.ok_shutdown { 0 } else { 1 });
}

/// The real Kafka wire-protocol codec is a narrow injected port, out of
/// scope for this crate. With `with_test_support` enabled,
/// the in-process fake broker's wire is wired in so the binary is runnable
/// for local smoke-testing; otherwise there is no adapter to construct and
/// the process exits asking for one.
#[cfg(feature = "with_test_support")]
fn build_wire(_logger: &Logger) -> Arc<dyn kafka_relay::wire::KafkaWire> {
    Arc::new(kafka_relay::test_support::fake_broker::FakeWire::default())
}

#[cfg(not(feature = "with_test_support"))]
fn build_wire(logger: &Logger) -> Arc<dyn kafka_relay::wire::KafkaWire> {
    slog::error!(logger, "no KafkaWire implementation compiled in; link a real wire-protocol adapter against this crate's `wire::KafkaWire` trait");
    exit(1);
}
