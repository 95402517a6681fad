//! The per-connector pipeline: turn queued messages into produce requests,
//! send them, and turn responses back into acks/retries/reroutes.

pub mod connector;
pub mod dispatcher;
pub mod request_factory;
pub mod response_processor;
