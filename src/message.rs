//! The message type routed end to end, and the state it passes through.
//!
//! A move-only value owned by exactly one container at a time, annotated
//! with a single-writer state for instrumentation.

/// How the producer wants this message routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingType {
    AnyPartition,
    PartitionKey(i32),
}

/// Observability states a message moves through. Single-writer per message;
/// advancing is the responsibility of whichever component currently owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgState {
    Batching,
    SendWait,
    AckWait,
    Processed,
}

/// Reasons a message can be discarded instead of delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    BadTopic,
    LongMsg,
    NoAvailablePartitions,
    RateLimit,
    KafkaErrorAck,
    FailedDeliveryAttemptLimit,
    FailedTopicAutocreate,
    ServerShutdown,
}

impl DiscardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::BadTopic => "bad_topic",
            DiscardReason::LongMsg => "long_msg",
            DiscardReason::NoAvailablePartitions => "no_available_partitions",
            DiscardReason::RateLimit => "rate_limit",
            DiscardReason::KafkaErrorAck => "kafka_error_ack",
            DiscardReason::FailedDeliveryAttemptLimit => "failed_delivery_attempt_limit",
            DiscardReason::FailedTopicAutocreate => "failed_topic_autocreate",
            DiscardReason::ServerShutdown => "server_shutdown",
        }
    }
}

/// The unit routed through the engine end to end.
///
/// `topic` is stored as an owned `String` rather than a reference into a
/// metadata snapshot on purpose: metadata can be replaced out
/// from under in-flight messages, so nothing may borrow from it.
#[derive(Clone, Debug)]
pub struct Message {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp_ms: i64,
    pub routing: RoutingType,
    pub partition: Option<i32>,
    pub failed_attempts: u32,
    pub body_truncated: bool,
    state: MsgState,
}

impl Message {
    pub fn new(topic: String, key: Option<Vec<u8>>, value: Vec<u8>, timestamp_ms: i64, routing: RoutingType) -> Message {
        Message {
            topic,
            key,
            value,
            timestamp_ms,
            routing,
            partition: None,
            failed_attempts: 0,
            body_truncated: false,
            state: MsgState::Batching,
        }
    }

    /// Number of bytes this message contributes to size-bound calculations:
    /// key + value + the wire protocol's fixed per-message overhead.
    pub fn wire_size(&self, single_msg_overhead: usize) -> usize {
        self.key.as_ref().map_or(0, Vec::len) + self.value.len() + single_msg_overhead
    }

    pub fn state(&self) -> MsgState {
        self.state
    }

    pub fn set_state(&mut self, state: MsgState) {
        self.state = state;
    }

    /// Bump the failed-delivery-attempt counter and report the new count.
    pub fn count_failed_attempt(&mut self) -> u32 {
        self.failed_attempts += 1;
        self.failed_attempts
    }

    /// A bounded prefix of the message value, for anomaly examples
    ///.
    pub fn value_prefix(&self, max_len: usize) -> Vec<u8> {
        let len = self.value.len().min(max_len);
        self.value[..len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size_accounts_for_overhead_and_key() {
        let msg = Message::new(
            "topic".into(),
            Some(vec![1, 2]),
            vec![0u8; 10],
            0,
            RoutingType::AnyPartition,
        );
        assert_eq!(msg.wire_size(5), 2 + 10 + 5);
    }

    #[test]
    fn attempt_counter_increments() {
        let mut msg = Message::new("t".into(), None, vec![], 0, RoutingType::AnyPartition);
        assert_eq!(msg.count_failed_attempt(), 1);
        assert_eq!(msg.count_failed_attempt(), 2);
    }
}
