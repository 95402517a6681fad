//! Produce-request factory: turns the connector's input queue of
//! messages into one `ProduceRequest` at a time, applying the two size
//! limits and the per-topic compression policy, with a fallback that rolls
//! a batch back to uncompressed on a bad compression ratio or codec error.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use slog::Logger;

use crate::config::CompressionNamedConfig;
use crate::config::CompressionType;
use crate::log_rate_limited;
use crate::logging::RateLimitedLog;
use crate::message::Message;
use crate::message::MsgState;
use crate::message::RoutingType;
use crate::metadata::MetadataSnapshot;
use crate::wire::KafkaWire;
use crate::wire::MsgSet;
use crate::wire::ProduceRequest;
use crate::wire::TAllTopics;
use crate::wire::WireCompression;

#[derive(Clone, Copy, Debug)]
struct EffectiveCompression {
    codec: WireCompression,
    min_size: usize,
    level: Option<u32>,
}

impl EffectiveCompression {
    fn from_config(c: &CompressionNamedConfig) -> Option<EffectiveCompression> {
        let codec = match c.kind {
            CompressionType::None => return None,
            CompressionType::Snappy => WireCompression::Snappy,
            CompressionType::Gzip => WireCompression::Gzip,
            CompressionType::Lz4 => WireCompression::Lz4,
        };
        Some(EffectiveCompression {
            codec,
            min_size: c.min_size,
            level: c.level,
        })
    }
}

/// Resolves per-topic compression config: override, else the crate-wide
/// default, else none.
#[derive(Clone)]
pub struct CompressionResolver {
    default: Option<EffectiveCompression>,
    overrides: HashMap<String, Option<EffectiveCompression>>,
    /// `compression_size_threshold_percent` from config: a compressed set is
    /// kept only if `compressed_len * 100 <= payload_len * threshold`.
    threshold_percent: u32,
}

impl CompressionResolver {
    pub fn new(
        default: Option<&CompressionNamedConfig>,
        overrides: &HashMap<String, CompressionNamedConfig>,
        threshold_percent: u32,
    ) -> CompressionResolver {
        CompressionResolver {
            default: default.and_then(EffectiveCompression::from_config),
            overrides: overrides
                .iter()
                .map(|(k, v)| (k.clone(), EffectiveCompression::from_config(v)))
                .collect(),
            threshold_percent,
        }
    }

    fn resolve(&self, topic: &str) -> Option<EffectiveCompression> {
        match self.overrides.get(topic) {
            Some(effective) => *effective,
            None => self.default,
        }
    }
}

/// Owned per-connector state: size limits, compression policy,
/// the AnyPartition broker-affinity chooser and the correlation-id counter.
pub struct RequestFactory {
    wire: Arc<dyn KafkaWire>,
    broker_index: usize,
    client_id: String,
    required_acks: i16,
    replication_timeout_ms: i32,
    produce_request_data_limit: usize,
    message_max_bytes: usize,
    compression: CompressionResolver,
    affinity_counters: HashMap<String, u64>,
    next_correlation_id: i32,
    no_partition_log: RateLimitedLog,
}

impl RequestFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wire: Arc<dyn KafkaWire>,
        broker_index: usize,
        client_id: String,
        required_acks: i16,
        replication_timeout_ms: i32,
        produce_request_data_limit: usize,
        message_max_bytes: usize,
        compression: CompressionResolver,
    ) -> RequestFactory {
        RequestFactory {
            wire,
            broker_index,
            client_id,
            required_acks,
            replication_timeout_ms,
            produce_request_data_limit,
            message_max_bytes,
            compression,
            affinity_counters: HashMap::new(),
            next_correlation_id: 0,
            no_partition_log: RateLimitedLog::new(Duration::from_secs(30)),
        }
    }

    fn choose_partition(&mut self, metadata: &MetadataSnapshot, topic: &str, this_request: &mut HashMap<String, i32>) -> Option<i32> {
        if let Some(&chosen) = this_request.get(topic) {
            return Some(chosen);
        }
        let choices = metadata.find_partition_choices(topic, self.broker_index)?;
        let counter = self.affinity_counters.entry(topic.to_string()).or_insert(0);
        let chosen = choices[(*counter as usize) % choices.len()];
        *counter = counter.wrapping_add(1);
        this_request.insert(topic.to_string(), chosen);
        Some(chosen)
    }

    /// Builds the next produce request from `pending`, or `None` if there is
    /// nothing ready to send yet. Messages that cannot be included in this
    /// request (either size limit, or a topic the broker no longer serves)
    /// are put back at the front of `pending` in their original relative
    /// order, for a later call to pick up.
    pub fn build_request(&mut self, metadata: &MetadataSnapshot, pending: &mut VecDeque<Message>, logger: &Logger) -> Option<ProduceRequest> {
        if pending.is_empty() {
            return None;
        }

        let single_msg_overhead = self.wire.single_msg_overhead();
        let mut all_topics: TAllTopics = TAllTopics::new();
        let mut total_bytes: usize = 0;
        let mut affinity_for_this_request: HashMap<String, i32> = HashMap::new();
        let mut deferred: VecDeque<Message> = VecDeque::new();
        let mut broke_on = None;

        while let Some(msg) = pending.pop_front() {
            let wire_size = msg.wire_size(single_msg_overhead);
            if total_bytes > 0 && total_bytes + wire_size > self.produce_request_data_limit {
                broke_on = Some(msg);
                break;
            }

            let partition = match msg.routing {
                RoutingType::PartitionKey(p) => Some(p),
                RoutingType::AnyPartition => self.choose_partition(metadata, &msg.topic, &mut affinity_for_this_request),
            };
            let partition = match partition {
                Some(p) => p,
                None => {
                    // The broker this connector serves no longer owns any
                    // partition of this topic; the router keeps per-broker
                    // queues consistent with metadata, so this should not
                    // happen in steady state.
                    log_rate_limited!(self.no_partition_log, "no_partition_choice", logger,
                        "dropping message for topic with no partition choice on this broker";
                        "topic" => &msg.topic);
                    continue;
                }
            };

            let will_compress = self.compression.resolve(&msg.topic).is_some();
            let existing_set_size = all_topics
                .get(&msg.topic)
                .and_then(|p| p.get(&partition))
                .map(|s| s.total_wire_size)
                .unwrap_or(0);
            if will_compress && existing_set_size > 0 && existing_set_size + wire_size > self.message_max_bytes {
                // Compression could fail to shrink this set; don't let it
                // grow past what an uncompressed request could ever send.
                deferred.push_back(msg);
                continue;
            }

            total_bytes += wire_size;
            let mut msg = msg;
            msg.set_state(MsgState::SendWait);
            all_topics
                .entry(msg.topic.clone())
                .or_default()
                .entry(partition)
                .or_insert_with(MsgSet::default)
                .push(msg, wire_size);
        }

        if let Some(msg) = broke_on {
            pending.push_front(msg);
        }
        for msg in deferred.into_iter().rev() {
            pending.push_front(msg);
        }

        if all_topics.is_empty() {
            return None;
        }

        let compressed = self.apply_compression(&all_topics, logger);
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);
        let client_id = self.client_id.clone();
        let bytes = self.wire.encode_produce_request(
            correlation_id,
            &client_id,
            self.required_acks,
            self.replication_timeout_ms,
            &all_topics,
            &compressed,
        );
        Some(ProduceRequest {
            correlation_id,
            bytes,
            all_topics,
        })
    }

    /// Step 4: per-(topic, partition) compression decision. Keeps the
    /// compressed payload only if it shrinks the set by at least the
    /// configured threshold; otherwise falls back to uncompressed (counted
    /// "not compressible") the same way a codec error does.
    fn apply_compression(&self, all_topics: &TAllTopics, logger: &Logger) -> BTreeMap<(String, i32), (WireCompression, Vec<u8>)> {
        let mut compressed = BTreeMap::new();
        for (topic, partitions) in all_topics {
            let effective = match self.compression.resolve(topic) {
                Some(e) => e,
                None => continue,
            };
            for (&partition, set) in partitions {
                if set.total_wire_size < effective.min_size {
                    continue;
                }
                let payload = self.wire.encode_msg_set_payload(&set.messages);
                match self.wire.compress(effective.codec, effective.level, &payload) {
                    Ok(encoded) => {
                        let ratio = encoded.len() as f64 / payload.len().max(1) as f64;
                        let ratio_ok = (encoded.len() as u128) * 100 <= (payload.len() as u128) * self.compression.threshold_percent as u128;
                        if ratio_ok {
                            crate::metrics::COMPRESSION_SAVINGS_RATIO.with_label_values(&[topic.as_str()]).set(ratio);
                            compressed.insert((topic.clone(), partition), (effective.codec, encoded));
                        }
                    }
                    Err(error) => {
                        slog::warn!(logger, "compression failed, sending uncompressed";
                            "topic" => topic, "partition" => partition, "error" => %error);
                    }
                }
            }
        }
        compressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RoutingType;
    use crate::test_support::fake_broker::FakeWire;
    use slog::Discard;

    fn logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    fn metadata_one_broker_two_partitions() -> MetadataSnapshot {
        let mut b = crate::metadata::MetadataBuilder::new(logger(), 1);
        b.open_brokers();
        b.add_broker(1, "b1".into(), 9092);
        b.close_brokers();
        b.open_topic("t");
        b.add_partition(0, 1, true, 0);
        b.add_partition(1, 1, true, 0);
        b.close_topic();
        b.build().unwrap()
    }

    fn factory_with_limit(produce_request_data_limit: usize) -> RequestFactory {
        RequestFactory::new(
            Arc::new(FakeWire::default()),
            0,
            "client".into(),
            1,
            10_000,
            produce_request_data_limit,
            1_000_000,
            CompressionResolver::new(None, &HashMap::new(), 100),
        )
    }

    fn factory() -> RequestFactory {
        factory_with_limit(1_000_000)
    }

    fn msg(topic: &str) -> Message {
        Message::new(topic.into(), None, vec![0u8; 10], 0, RoutingType::AnyPartition)
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let metadata = metadata_one_broker_two_partitions();
        let mut factory = factory();
        let mut queue = VecDeque::new();
        assert!(factory.build_request(&metadata, &mut queue, &logger()).is_none());
    }

    #[test]
    fn groups_messages_by_partition_and_latches_choice_within_request() {
        let metadata = metadata_one_broker_two_partitions();
        let mut factory = factory();
        let mut queue = VecDeque::new();
        queue.push_back(msg("t"));
        queue.push_back(msg("t"));
        let request = factory.build_request(&metadata, &mut queue, &logger()).unwrap();
        assert_eq!(request.all_topics.len(), 1);
        let partitions = &request.all_topics["t"];
        assert_eq!(partitions.len(), 1, "both AnyPartition msgs in one request land on the same partition");
        assert_eq!(partitions.values().next().unwrap().messages.len(), 2);
    }

    #[test]
    fn respects_total_request_byte_limit() {
        let metadata = metadata_one_broker_two_partitions();
        // Tiny limit: only one 10-byte-value message fits alongside overhead.
        let mut factory = factory_with_limit(30);
        let mut queue = VecDeque::new();
        queue.push_back(msg("t"));
        queue.push_back(msg("t"));
        queue.push_back(msg("t"));
        let request = factory.build_request(&metadata, &mut queue, &logger()).unwrap();
        let sent: usize = request.all_topics["t"].values().map(|s| s.messages.len()).sum();
        assert!(sent < 3, "at least one message should be left for a later request");
        assert!(!queue.is_empty());
    }

    #[test]
    fn oversized_single_message_is_still_sent_alone() {
        let metadata = metadata_one_broker_two_partitions();
        // Smaller than even one message's wire size.
        let mut factory = factory_with_limit(5);
        let mut queue = VecDeque::new();
        queue.push_back(msg("t"));
        let request = factory.build_request(&metadata, &mut queue, &logger()).unwrap();
        let sent: usize = request.all_topics["t"].values().map(|s| s.messages.len()).sum();
        assert_eq!(sent, 1);
    }

    #[test]
    fn affinity_round_robins_across_requests() {
        let metadata = metadata_one_broker_two_partitions();
        let mut factory = factory();
        let mut first = VecDeque::new();
        first.push_back(msg("t"));
        let r1 = factory.build_request(&metadata, &mut first, &logger()).unwrap();
        let p1 = *r1.all_topics["t"].keys().next().unwrap();

        let mut second = VecDeque::new();
        second.push_back(msg("t"));
        let r2 = factory.build_request(&metadata, &mut second, &logger()).unwrap();
        let p2 = *r2.all_topics["t"].keys().next().unwrap();
        assert_ne!(p1, p2, "successive requests should round robin across the broker's partitions");
    }
}
