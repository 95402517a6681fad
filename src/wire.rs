//! The narrow Kafka wire interface: bytes-on-the-wire encoding/decoding is
//! out of scope for this crate, so this module only defines the trait
//! boundary the request factory, the connector and the response processor
//! are built against, plus the abstract ack-action categories and the
//! concrete-error-code table that realizes them against Kafka's stable,
//! documented numeric error codes.

use std::collections::BTreeMap;

use crate::message::Message;

/// Per-`(topic, partition)` group of messages building up in a request.
/// Keyed with `BTreeMap` so iteration order is deterministic.
pub type TAllTopics = BTreeMap<String, BTreeMap<i32, MsgSet>>;

/// One wire-level `(topic, partition)` group: the messages and the total
/// bytes they will occupy on the wire (post size-accounting, pre actual
/// compression).
#[derive(Debug, Default)]
pub struct MsgSet {
    pub messages: Vec<Message>,
    pub total_wire_size: usize,
}

impl MsgSet {
    pub fn push(&mut self, msg: Message, wire_size: usize) {
        self.total_wire_size += wire_size;
        self.messages.push(msg);
    }
}

/// How a msg-set was actually written to the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCompression {
    None,
    Gzip,
    Snappy,
    Lz4,
}

/// A fully-built produce request ready to send: framed bytes plus the state
/// needed to interpret its response.
pub struct ProduceRequest {
    pub correlation_id: i32,
    pub bytes: Vec<u8>,
    pub all_topics: TAllTopics,
}

impl ProduceRequest {
    /// All messages this request carries, in no particular cross-partition
    /// order. Used to recover messages for rerouting when a connection is
    /// abandoned mid-flight.
    pub fn into_messages(self) -> impl Iterator<Item = Message> {
        self.all_topics.into_values().flat_map(|partitions| partitions.into_values().flat_map(|set| set.messages))
    }
}

/// One partition-level ack as read off a produce response.
pub struct PartitionAck {
    pub partition: i32,
    pub error_code: i16,
}

/// One topic's partition acks as read off a produce response.
pub struct TopicAck {
    pub topic: String,
    pub partitions: Vec<PartitionAck>,
}

/// A decoded produce response.
pub struct ProduceResponse {
    pub correlation_id: i32,
    pub topics: Vec<TopicAck>,
}

/// The narrow seam between the transit engine and Kafka wire bytes.
/// A production build of this crate would implement `KafkaWire` against an
/// actual request writer / response reader; tests use
/// [`crate::test_support::fake_broker`]'s implementation.
pub trait KafkaWire: Send + Sync {
    /// The additive per-message framing overhead the factory uses for size
    /// calculations.
    fn single_msg_overhead(&self) -> usize;

    /// Serialize a produce request. `required_acks`/`replication_timeout_ms`
    /// come from config; `client_id` is the effective client id
    /// (post 0.9.0.0 workaround).
    #[allow(clippy::too_many_arguments)]
    fn encode_produce_request(
        &self,
        correlation_id: i32,
        client_id: &str,
        required_acks: i16,
        replication_timeout_ms: i32,
        all_topics: &TAllTopics,
        compressed: &BTreeMap<(String, i32), (WireCompression, Vec<u8>)>,
    ) -> Vec<u8>;

    /// Compress one serialized msg-set payload with the given codec.
    fn compress(&self, codec: WireCompression, level: Option<u32>, payload: &[u8]) -> ::std::io::Result<Vec<u8>>;

    /// Serialize just the messages of one msg-set, for measuring/compressing
    /// in isolation.
    fn encode_msg_set_payload(&self, messages: &[Message]) -> Vec<u8>;

    /// Parse a produce response. Returns `None` on a malformed/too-short
    /// response, treated identically to a correlation mismatch.
    fn decode_produce_response(&self, bytes: &[u8]) -> Option<ProduceResponse>;

    fn make_metadata_request(&self, topics: Option<&[String]>) -> Vec<u8>;
    fn make_topic_autocreate_request(&self, topic: &str) -> Vec<u8>;

    /// Parses a metadata response into its raw wire shape; the router turns
    /// this into a [`crate::metadata::MetadataSnapshot`] via
    /// [`crate::metadata::MetadataBuilder`], the same way the factory and
    /// connector never touch wire bytes directly.
    fn decode_metadata_response(&self, bytes: &[u8]) -> Option<RawMetadata>;

    fn decode_autocreate_response(&self, bytes: &[u8]) -> Option<AutocreateOutcome>;
}

/// One broker entry as read off a metadata response, pre-renumbering.
pub struct RawBroker {
    pub id: i32,
    pub host: String,
    pub port: u16,
}

/// One partition entry as read off a metadata response.
pub struct RawPartition {
    pub id: i32,
    pub leader_broker_id: i32,
    pub error_code: i16,
}

pub struct RawTopic {
    pub name: String,
    pub partitions: Vec<RawPartition>,
}

/// Wire-level metadata response, handed to [`crate::metadata::MetadataBuilder`]
/// to produce an immutable, sanity-checked snapshot.
pub struct RawMetadata {
    pub brokers: Vec<RawBroker>,
    pub topics: Vec<RawTopic>,
}

/// Result of a topic autocreate request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutocreateOutcome {
    Success,
    Fail,
    TryOtherBroker,
}

/// The three recovery shapes the error-code policy table maps Kafka's
/// numeric produce-response error codes onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckCategory {
    Ok,
    TransientRetrySameBroker,
    RerouteNeeded,
    PermanentForMessage,
}

/// Maps a concrete Kafka produce-response error code to an abstract
/// category.
///
/// Codes follow the stable, documented Kafka protocol error-code list;
/// anything not explicitly recognised is treated as "undocumented/Unknown"
/// and is permanent-for-this-message, per spec.
pub fn error_category(code: i16) -> AckCategory {
    match code {
        0 => AckCategory::Ok,
        // CorruptMessage
        2 => AckCategory::TransientRetrySameBroker,
        // LeaderNotAvailable, NotLeaderForPartition, RequestTimedOut,
        // NetworkException (here modeled as -1 "unknown/no response" too),
        // UnknownTopicOrPartition.
        5 | 6 | 7 | 3 | 13 => AckCategory::RerouteNeeded,
        // MessageTooLarge, OffsetOutOfRange, RecordListTooLarge,
        // InvalidTopicException, authorization failures.
        10 | 1 | 18 | 17 | 29 | 30 | 31 => AckCategory::PermanentForMessage,
        _ => AckCategory::PermanentForMessage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_categories() {
        assert_eq!(error_category(0), AckCategory::Ok);
        assert_eq!(error_category(2), AckCategory::TransientRetrySameBroker);
        assert_eq!(error_category(6), AckCategory::RerouteNeeded);
        assert_eq!(error_category(10), AckCategory::PermanentForMessage);
    }

    #[test]
    fn unknown_code_is_permanent() {
        assert_eq!(error_category(9001), AckCategory::PermanentForMessage);
    }
}
