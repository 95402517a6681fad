//! Test-only support code: a fake `KafkaWire` and an
//! in-process fake broker, gated behind the `with_test_support` feature so
//! release builds never link them in.

pub mod fake_broker;
