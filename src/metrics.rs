//! Process-wide `prometheus` metrics, registered once from `main` the way
//! `replicante_service_tasks::register_metrics` registers
//! `service/tasks/src/metrics.rs`'s counters.

use lazy_static::lazy_static;
use prometheus::CounterVec;
use prometheus::GaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use slog::warn;
use slog::Logger;

lazy_static! {
    pub static ref ACK_TOTAL: CounterVec = CounterVec::new(
        Opts::new("kafka_relay_ack_total", "Produce-response acks observed, by outcome"),
        &["outcome"]
    )
    .expect("ack_total metric");
    pub static ref DISCARD_TOTAL: CounterVec = CounterVec::new(
        Opts::new("kafka_relay_discard_total", "Messages discarded, by reason"),
        &["reason"]
    )
    .expect("discard_total metric");
    pub static ref DUPLICATE_TOTAL: CounterVec = CounterVec::new(
        Opts::new("kafka_relay_duplicate_total", "Possible duplicates logged, by topic"),
        &["topic"]
    )
    .expect("duplicate_total metric");
    pub static ref PAUSE_TOTAL: CounterVec =
        CounterVec::new(Opts::new("kafka_relay_pause_total", "Pause events handled"), &["trigger"])
            .expect("pause_total metric");
    pub static ref DISPATCHER_RESTART_TOTAL: CounterVec = CounterVec::new(
        Opts::new("kafka_relay_dispatcher_restart_total", "Dispatcher restarts"),
        &["reason"]
    )
    .expect("dispatcher_restart_total metric");
    pub static ref CONNECTOR_STATE: GaugeVec = GaugeVec::new(
        Opts::new("kafka_relay_connector_state", "Current connector lifecycle state (enum as gauge)"),
        &["broker", "state"]
    )
    .expect("connector_state metric");
    pub static ref BATCH_EMITTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("kafka_relay_batch_emitted_total", "Batches emitted by the per-topic batcher"),
        &["topic"]
    )
    .expect("batch_emitted_total metric");
    pub static ref COMPRESSION_SAVINGS_RATIO: GaugeVec = GaugeVec::new(
        Opts::new("kafka_relay_compression_savings_ratio", "Last observed compressed/uncompressed size ratio, by topic"),
        &["topic"]
    )
    .expect("compression_savings_ratio metric");
}

/// Registers every metric family with `registry`; failures (e.g. duplicate
/// registration in tests) are logged and ignored rather than treated as
/// fatal — metrics wiring should never be able to take the process down.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    for collector in [
        Box::new(ACK_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(DISCARD_TOTAL.clone()),
        Box::new(DUPLICATE_TOTAL.clone()),
        Box::new(PAUSE_TOTAL.clone()),
        Box::new(DISPATCHER_RESTART_TOTAL.clone()),
        Box::new(CONNECTOR_STATE.clone()),
        Box::new(BATCH_EMITTED_TOTAL.clone()),
        Box::new(COMPRESSION_SAVINGS_RATIO.clone()),
    ] {
        if let Err(error) = registry.register(collector) {
            warn!(logger, "failed to register metric"; "error" => %error);
        }
    }
}
