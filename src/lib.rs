//! The producer-side Kafka relay transit engine: router, per-broker
//! dispatcher/connectors, metadata model, produce-request factory and
//! produce-response processor, plus the anomaly/rate/failure tracking that
//! governs pause/retry/discard. See `router::Router` for the entry point a
//! binary drives; bytes-on-the-wire encoding is a narrow port
//! (`wire::KafkaWire`) this crate is built against, not implemented by it.

pub mod anomaly;
pub mod batcher;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod msg_dispatch;
pub mod rate_limit;
pub mod router;
pub mod sync;
pub mod wire;

#[cfg(any(test, feature = "with_test_support"))]
pub mod test_support;
