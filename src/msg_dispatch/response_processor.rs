//! Produce-response processor: walks a decoded response against
//! the `TAllTopics` it answers and turns each partition ack into one of
//! success / immediate-resend / pause-and-resend / discard.

use std::sync::Arc;
use std::time::Duration;

use slog::Logger;

use crate::anomaly::AnomalyTracker;
use crate::log_rate_limited;
use crate::logging::RateLimitedLog;
use crate::message::DiscardReason;
use crate::message::Message;
use crate::message::MsgState;
use crate::metrics;
use crate::wire::AckCategory;
use crate::wire::KafkaWire;
use crate::wire::ProduceRequest;

/// The connector's next move, in increasing order of severity — callers
/// should keep the maximum seen across a batch of responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectorAction {
    KeepRunning,
    PauseAndDeferFinish,
    PauseAndFinishNow,
}

/// What came out of processing one response: the connector's next action
/// plus the messages that need to go somewhere other than "done".
#[derive(Default)]
pub struct ProcessOutcome {
    pub action_is_pause_now: bool,
    pub action_is_pause_deferred: bool,
    /// Pushed back to the front of this connector's own factory input.
    pub immediate_resend: Vec<Message>,
    /// Handed to the router for re-routing once the dispatcher restarts.
    pub pause_and_resend: Vec<Message>,
}

impl ProcessOutcome {
    pub fn action(&self) -> ConnectorAction {
        if self.action_is_pause_now {
            ConnectorAction::PauseAndFinishNow
        } else if self.action_is_pause_deferred {
            ConnectorAction::PauseAndDeferFinish
        } else {
            ConnectorAction::KeepRunning
        }
    }
}

pub struct ResponseProcessor {
    max_failed_delivery_attempts: u32,
    anomaly: Arc<AnomalyTracker>,
    bad_response_log: RateLimitedLog,
}

impl ResponseProcessor {
    pub fn new(max_failed_delivery_attempts: u32, anomaly: Arc<AnomalyTracker>) -> ResponseProcessor {
        ResponseProcessor {
            max_failed_delivery_attempts,
            anomaly,
            bad_response_log: RateLimitedLog::new(Duration::from_secs(30)),
        }
    }

    /// Consumes `request`, matching it against the bytes of its response.
    pub fn process_response(&self, mut request: ProduceRequest, response_bytes: &[u8], wire: &dyn KafkaWire, logger: &Logger) -> ProcessOutcome {
        let response = match wire.decode_produce_response(response_bytes) {
            Some(r) => r,
            None => {
                log_rate_limited!(self.bad_response_log, "malformed_response", logger,
                    "malformed produce response, pausing");
                return self.all_no_ack(request);
            }
        };
        if response.correlation_id != request.correlation_id {
            log_rate_limited!(self.bad_response_log, "correlation_mismatch", logger,
                "correlation id mismatch, pausing";
                "expected" => request.correlation_id, "actual" => response.correlation_id);
            return self.all_no_ack(request);
        }

        let mut outcome = ProcessOutcome::default();
        for topic_ack in &response.topics {
            let partitions = match request.all_topics.get_mut(&topic_ack.topic) {
                Some(p) => p,
                None => {
                    log_rate_limited!(self.bad_response_log, "unexpected_topic", logger,
                        "produce response referenced unexpected topic, pausing";
                        "topic" => &topic_ack.topic);
                    outcome.action_is_pause_now = true;
                    continue;
                }
            };
            for partition_ack in &topic_ack.partitions {
                let set = match partitions.remove(&partition_ack.partition) {
                    Some(s) => s,
                    None => {
                        log_rate_limited!(self.bad_response_log, "unexpected_partition", logger,
                            "produce response referenced unexpected partition, pausing";
                            "topic" => &topic_ack.topic, "partition" => partition_ack.partition);
                        outcome.action_is_pause_now = true;
                        continue;
                    }
                };
                self.apply_ack(set.messages, partition_ack.error_code, &topic_ack.topic, &mut outcome, logger);
            }
        }

        // Anything left in all_topics wasn't covered by the response: a
        // short topic or partition list, identical to a correlation
        // mismatch in severity.
        let leftover: Vec<Message> = request.into_messages().collect();
        if !leftover.is_empty() {
            log_rate_limited!(self.bad_response_log, "short_response", logger,
                "produce response shorter than request, pausing");
            outcome.action_is_pause_now = true;
            outcome.pause_and_resend.extend(leftover);
        }
        outcome
    }

    fn all_no_ack(&self, request: ProduceRequest) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        outcome.action_is_pause_now = true;
        outcome.pause_and_resend = request.into_messages().collect();
        for msg in &mut outcome.pause_and_resend {
            msg.set_state(MsgState::SendWait);
        }
        outcome
    }

    fn apply_ack(&self, mut messages: Vec<Message>, error_code: i16, topic: &str, outcome: &mut ProcessOutcome, logger: &Logger) {
        match crate::wire::error_category(error_code) {
            AckCategory::Ok => {
                metrics::ACK_TOTAL.with_label_values(&["ok"]).inc();
                for msg in &mut messages {
                    msg.set_state(MsgState::Processed);
                }
            }
            AckCategory::TransientRetrySameBroker => {
                metrics::ACK_TOTAL.with_label_values(&["transient_retry"]).inc();
                slog::warn!(logger, "transient produce error, resending"; "topic" => topic, "error_code" => error_code);
                let resend = self.count_attempts_and_split(messages, topic);
                outcome.immediate_resend.extend(resend);
            }
            AckCategory::RerouteNeeded => {
                metrics::ACK_TOTAL.with_label_values(&["reroute_needed"]).inc();
                slog::warn!(logger, "produce error needs reroute, pausing"; "topic" => topic, "error_code" => error_code);
                outcome.action_is_pause_deferred = true;
                let resend = self.count_attempts_and_split(messages, topic);
                outcome.pause_and_resend.extend(resend);
            }
            AckCategory::PermanentForMessage => {
                metrics::ACK_TOTAL.with_label_values(&["permanent"]).inc();
                for msg in messages {
                    self.anomaly.discard(&msg, DiscardReason::KafkaErrorAck);
                }
                metrics::DISCARD_TOTAL.with_label_values(&[DiscardReason::KafkaErrorAck.as_str()]).inc();
            }
        }
    }

    /// Bumps each message's failed-attempt counter, discarding any that
    /// exceed the configured limit; returns the ones still eligible to be
    /// resent.
    fn count_attempts_and_split(&self, messages: Vec<Message>, _topic: &str) -> Vec<Message> {
        let mut keep = Vec::with_capacity(messages.len());
        for mut msg in messages {
            if msg.count_failed_attempt() > self.max_failed_delivery_attempts {
                self.anomaly.discard(&msg, DiscardReason::FailedDeliveryAttemptLimit);
                metrics::DISCARD_TOTAL.with_label_values(&[DiscardReason::FailedDeliveryAttemptLimit.as_str()]).inc();
            } else {
                msg.set_state(MsgState::SendWait);
                keep.push(msg);
            }
        }
        keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RoutingType;
    use crate::test_support::fake_broker::FakeWire;
    use crate::wire::MsgSet;
    use crate::wire::TAllTopics;
    use slog::Discard;

    fn logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    fn one_msg_request(topic: &str, partition: i32, correlation_id: i32) -> ProduceRequest {
        let mut all_topics: TAllTopics = TAllTopics::new();
        let mut set = MsgSet::default();
        let msg = Message::new(topic.into(), None, vec![1, 2, 3], 0, RoutingType::AnyPartition);
        set.push(msg, 16);
        all_topics.entry(topic.to_string()).or_default().insert(partition, set);
        ProduceRequest { correlation_id, bytes: Vec::new(), all_topics }
    }

    fn response_json(correlation_id: i32, topic: &str, partition: i32, error_code: i16) -> Vec<u8> {
        serde_json::to_vec(&crate::test_support::fake_broker::WireResponse {
            correlation_id,
            topics: vec![crate::test_support::fake_broker::WireResponseTopic {
                topic: topic.to_string(),
                partitions: vec![crate::test_support::fake_broker::WireResponsePartition { partition, error_code }],
            }],
        })
        .unwrap()
    }

    #[test]
    fn ok_ack_keeps_running_with_no_resend() {
        let processor = ResponseProcessor::new(3, Arc::new(AnomalyTracker::new(Duration::from_secs(60), 64)));
        let wire = FakeWire::default();
        let request = one_msg_request("t", 0, 7);
        let bytes = response_json(7, "t", 0, 0);
        let outcome = processor.process_response(request, &bytes, &wire, &logger());
        assert_eq!(outcome.action(), ConnectorAction::KeepRunning);
        assert!(outcome.immediate_resend.is_empty());
        assert!(outcome.pause_and_resend.is_empty());
    }

    #[test]
    fn correlation_mismatch_pauses_and_requeues_everything() {
        let processor = ResponseProcessor::new(3, Arc::new(AnomalyTracker::new(Duration::from_secs(60), 64)));
        let wire = FakeWire::default();
        let request = one_msg_request("t", 0, 7);
        let bytes = response_json(999, "t", 0, 0);
        let outcome = processor.process_response(request, &bytes, &wire, &logger());
        assert_eq!(outcome.action(), ConnectorAction::PauseAndFinishNow);
        assert_eq!(outcome.pause_and_resend.len(), 1);
    }

    #[test]
    fn transient_error_is_queued_for_immediate_resend() {
        let processor = ResponseProcessor::new(3, Arc::new(AnomalyTracker::new(Duration::from_secs(60), 64)));
        let wire = FakeWire::default();
        let request = one_msg_request("t", 0, 1);
        let bytes = response_json(1, "t", 0, 2); // CorruptMessage
        let outcome = processor.process_response(request, &bytes, &wire, &logger());
        assert_eq!(outcome.action(), ConnectorAction::KeepRunning);
        assert_eq!(outcome.immediate_resend.len(), 1);
        assert_eq!(outcome.immediate_resend[0].failed_attempts, 1);
    }

    #[test]
    fn reroute_needed_defers_pause_and_queues_for_router() {
        let processor = ResponseProcessor::new(3, Arc::new(AnomalyTracker::new(Duration::from_secs(60), 64)));
        let wire = FakeWire::default();
        let request = one_msg_request("t", 0, 1);
        let bytes = response_json(1, "t", 0, 6); // NotLeaderForPartition
        let outcome = processor.process_response(request, &bytes, &wire, &logger());
        assert_eq!(outcome.action(), ConnectorAction::PauseAndDeferFinish);
        assert_eq!(outcome.pause_and_resend.len(), 1);
    }

    #[test]
    fn permanent_error_discards_without_pausing() {
        let processor = ResponseProcessor::new(3, Arc::new(AnomalyTracker::new(Duration::from_secs(60), 64)));
        let wire = FakeWire::default();
        let request = one_msg_request("t", 0, 1);
        let bytes = response_json(1, "t", 0, 10); // MessageTooLarge
        let outcome = processor.process_response(request, &bytes, &wire, &logger());
        assert_eq!(outcome.action(), ConnectorAction::KeepRunning);
        assert!(outcome.immediate_resend.is_empty());
        assert!(outcome.pause_and_resend.is_empty());
    }

    #[test]
    fn attempt_limit_discards_instead_of_resending() {
        let processor = ResponseProcessor::new(0, Arc::new(AnomalyTracker::new(Duration::from_secs(60), 64)));
        let wire = FakeWire::default();
        let request = one_msg_request("t", 0, 1);
        let bytes = response_json(1, "t", 0, 2); // transient, but limit is 0
        let outcome = processor.process_response(request, &bytes, &wire, &logger());
        assert!(outcome.immediate_resend.is_empty());
    }
}
