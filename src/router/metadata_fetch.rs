//! Blocking metadata/autocreate request-response exchange used only during
//! bootstrap, refresh and autocreate. Unlike the connector, which must
//! interleave several wake conditions on one long-lived connection, these
//! are one-shot round trips: connect, write one framed request, read one
//! framed response, disconnect.

use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;

use slog::Logger;

use crate::config::BrokerAddr;
use crate::wire::AutocreateOutcome;
use crate::wire::KafkaWire;
use crate::wire::RawMetadata;

fn round_trip(host: &str, port: u16, request: &[u8], socket_timeout: Duration, logger: &Logger) -> Option<Vec<u8>> {
    let addr = match (host, port).to_socket_addrs().ok().and_then(|mut it| it.next()) {
        Some(a) => a,
        None => {
            slog::warn!(logger, "address resolution failed"; "host" => host, "port" => port);
            return None;
        }
    };
    let mut stream = match TcpStream::connect_timeout(&addr, socket_timeout) {
        Ok(s) => s,
        Err(error) => {
            slog::warn!(logger, "connect failed"; "host" => host, "port" => port, "error" => %error);
            return None;
        }
    };
    stream.set_read_timeout(Some(socket_timeout)).ok();
    stream.set_write_timeout(Some(socket_timeout)).ok();
    if let Err(error) = stream.write_all(request) {
        slog::warn!(logger, "write failed"; "host" => host, "port" => port, "error" => %error);
        return None;
    }
    let mut len_buf = [0u8; 4];
    if let Err(error) = stream.read_exact(&mut len_buf) {
        slog::warn!(logger, "read failed"; "host" => host, "port" => port, "error" => %error);
        return None;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    if let Err(error) = stream.read_exact(&mut body) {
        slog::warn!(logger, "short read"; "host" => host, "port" => port, "error" => %error);
        return None;
    }
    Some(body)
}

/// Tries every broker starting at `start_index`, wrapping once, until one
/// answers a metadata request; `topics` narrows the request to specific
/// topics (used nowhere yet, since this crate always asks for all topics,
/// but the wire port exposes the narrower form too).
pub fn fetch_metadata(
    brokers: &[BrokerAddr],
    start_index: usize,
    wire: &dyn KafkaWire,
    socket_timeout: Duration,
    logger: &Logger,
) -> Option<RawMetadata> {
    let request = wire.make_metadata_request(None);
    for offset in 0..brokers.len() {
        let broker = &brokers[(start_index + offset) % brokers.len()];
        slog::info!(logger, "fetching metadata"; "host" => &broker.host, "port" => broker.port);
        let body = match round_trip(&broker.host, broker.port, &request, socket_timeout, logger) {
            Some(b) => b,
            None => continue,
        };
        match wire.decode_metadata_response(&body) {
            Some(raw) => return Some(raw),
            None => {
                slog::warn!(logger, "malformed metadata response"; "host" => &broker.host, "port" => broker.port);
                continue;
            }
        }
    }
    None
}

/// Tries every broker starting at `start_index` until one returns a
/// definitive `Success`/`Fail`; a `TryOtherBroker` (or connect/parse
/// failure) advances to the next broker.
pub fn autocreate_topic(
    brokers: &[BrokerAddr],
    start_index: usize,
    topic: &str,
    wire: &dyn KafkaWire,
    socket_timeout: Duration,
    logger: &Logger,
) -> Option<AutocreateOutcome> {
    let request = wire.make_topic_autocreate_request(topic);
    for offset in 0..brokers.len() {
        let broker = &brokers[(start_index + offset) % brokers.len()];
        let body = match round_trip(&broker.host, broker.port, &request, socket_timeout, logger) {
            Some(b) => b,
            None => continue,
        };
        match wire.decode_autocreate_response(&body) {
            Some(AutocreateOutcome::TryOtherBroker) => continue,
            Some(outcome) => return Some(outcome),
            None => continue,
        }
    }
    None
}
