//! Immutable metadata snapshot and its builder.
//!
//! Brokers are reordered so in-service brokers form a contiguous prefix, each topic's
//! `ok_partitions` is shuffled once per build so that round-robin broker
//! selection differs across process starts (and across metadata
//! generations), and a flat `topic_broker_vec` plus per-topic
//! `(offset, count)` map lets a connector look up "which partitions of this
//! topic does the broker I'm talking to own" in O(1).

use std::collections::HashMap;
use std::collections::HashSet;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use slog::warn;
use slog::Logger;

/// One broker entry in a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broker {
    pub id: i32,
    pub host: String,
    pub port: u16,
    pub in_service: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Partition {
    id: i32,
    broker_index: usize,
    error_code: i16,
}

#[derive(Clone, Debug)]
struct Topic {
    name: String,
    ok_partitions: Vec<Partition>,
    out_of_service_partitions: Vec<Partition>,
    all_partitions: Vec<Partition>,
    /// broker_index -> (offset, count) into the snapshot's flat `topic_broker_vec`.
    choice_map: HashMap<usize, (usize, usize)>,
}

/// Immutable once built; shared by reference-count between the router and
/// every connector.
#[derive(Clone, Debug)]
pub struct MetadataSnapshot {
    brokers: Vec<Broker>,
    num_in_service: usize,
    topics: Vec<Topic>,
    topic_index: HashMap<String, usize>,
    topic_broker_vec: Vec<i32>,
    /// Monotonic, for log/metric correlation only; excluded from equality.
    pub generation: u64,
}

impl MetadataSnapshot {
    pub fn brokers(&self) -> &[Broker] {
        &self.brokers
    }

    pub fn num_in_service(&self) -> usize {
        self.num_in_service
    }

    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|t| t.name.as_str())
    }

    pub fn topic_index(&self, topic: &str) -> Option<usize> {
        self.topic_index.get(topic).copied()
    }

    pub fn ok_partition_count(&self, topic_idx: usize) -> usize {
        self.topics[topic_idx].ok_partitions.len()
    }

    /// AnyPartition round robin: pick `ok_partitions[counter mod len]`.
    pub fn ok_partition_at(&self, topic_idx: usize, counter: u64) -> Option<i32> {
        let ok = &self.topics[topic_idx].ok_partitions;
        if ok.is_empty() {
            return None;
        }
        Some(ok[(counter as usize) % ok.len()].id)
    }

    /// All partitions for a topic (used for PartitionKey routing), sorted by id.
    pub fn all_partition_ids(&self, topic_idx: usize) -> impl Iterator<Item = i32> + '_ {
        self.topics[topic_idx].all_partitions.iter().map(|p| p.id)
    }

    /// Whether the given partition id of a topic currently has an in-service leader.
    pub fn partition_in_service(&self, topic_idx: usize, partition_id: i32) -> bool {
        self.topics[topic_idx]
            .ok_partitions
            .iter()
            .any(|p| p.id == partition_id)
    }

    /// Broker that owns (leads) the given partition, if in service.
    pub fn broker_for_partition(&self, topic_idx: usize, partition_id: i32) -> Option<usize> {
        self.topics[topic_idx]
            .ok_partitions
            .iter()
            .find(|p| p.id == partition_id)
            .map(|p| p.broker_index)
    }

    /// The strictly-ascending slice of partition ids the given broker holds
    /// for the topic, or `None` if the broker holds none.
    pub fn find_partition_choices(&self, topic: &str, broker_index: usize) -> Option<&[i32]> {
        let topic_idx = self.topic_index(topic)?;
        let (offset, count) = *self.topics[topic_idx].choice_map.get(&broker_index)?;
        Some(&self.topic_broker_vec[offset..offset + count])
    }

    /// Fatal on failure: a metadata response with duplicate broker ids,
    /// partitions pointing at unknown brokers, or a topic with zero
    /// partitions is not something a refresh should silently paper over.
    pub fn sanity_check(&self) -> ::std::result::Result<(), String> {
        let mut seen_broker_ids = HashSet::new();
        for broker in &self.brokers {
            if !seen_broker_ids.insert(broker.id) {
                return Err(format!("duplicate broker id {}", broker.id));
            }
        }
        let in_service_prefix = self.brokers.iter().take(self.num_in_service).all(|b| b.in_service);
        let rest_out_of_service = self.brokers.iter().skip(self.num_in_service).all(|b| !b.in_service);
        if !in_service_prefix || !rest_out_of_service {
            return Err("in-service brokers are not a contiguous prefix".into());
        }

        let mut seen_topics = HashSet::new();
        for topic in &self.topics {
            if !seen_topics.insert(topic.name.clone()) {
                return Err(format!("duplicate topic '{}'", topic.name));
            }
            if topic.ok_partitions.len() + topic.out_of_service_partitions.len() != topic.all_partitions.len() {
                return Err(format!("topic '{}': ok+oos != all", topic.name));
            }
            let mut ids = HashSet::new();
            for p in topic.ok_partitions.iter().chain(topic.out_of_service_partitions.iter()) {
                if !ids.insert(p.id) {
                    return Err(format!("topic '{}': partition {} in both ok and oos", topic.name, p.id));
                }
                if p.broker_index >= self.brokers.len() {
                    return Err(format!("topic '{}': partition {} has unknown broker", topic.name, p.id));
                }
            }
            for (&broker_index, &(offset, count)) in &topic.choice_map {
                let slice = &self.topic_broker_vec[offset..offset + count];
                if slice.is_empty() {
                    return Err(format!("topic '{}': empty choice slice for broker {}", topic.name, broker_index));
                }
                if !slice.windows(2).all(|w| w[0] < w[1]) {
                    return Err(format!("topic '{}': choice slice for broker {} not strictly ascending", topic.name, broker_index));
                }
            }
        }
        Ok(())
    }
}

/// Equality is content-based (multiset of brokers/partitions), not order- or
/// generation-sensitive, so a refresh that fetches the same topology back
/// in a different order is recognized as unchanged.
impl PartialEq for MetadataSnapshot {
    fn eq(&self, other: &MetadataSnapshot) -> bool {
        let mut mine: Vec<&Broker> = self.brokers.iter().collect();
        let mut theirs: Vec<&Broker> = other.brokers.iter().collect();
        mine.sort_by_key(|b| b.id);
        theirs.sort_by_key(|b| b.id);
        if mine != theirs {
            return false;
        }

        let mut my_topics: HashMap<&str, &Topic> = self.topics.iter().map(|t| (t.name.as_str(), t)).collect();
        let their_topics: HashMap<&str, &Topic> = other.topics.iter().map(|t| (t.name.as_str(), t)).collect();
        if my_topics.len() != their_topics.len() {
            return false;
        }
        for (name, topic) in their_topics.iter() {
            let mine = match my_topics.remove(name) {
                Some(t) => t,
                None => return false,
            };
            if !partition_multiset(&mine.ok_partitions, &self.brokers)
                .eq(&partition_multiset(&topic.ok_partitions, &other.brokers))
            {
                return false;
            }
            if !partition_multiset(&mine.out_of_service_partitions, &self.brokers)
                .eq(&partition_multiset(&topic.out_of_service_partitions, &other.brokers))
            {
                return false;
            }
        }
        true
    }
}
impl Eq for MetadataSnapshot {}

/// `(partition_id, broker_id, error_code)` triples, order-independent.
fn partition_multiset(partitions: &[Partition], brokers: &[Broker]) -> HashSet<(i32, i32, i16)> {
    partitions
        .iter()
        .map(|p| (p.id, brokers[p.broker_index].id, p.error_code))
        .collect()
}

#[derive(Default)]
pub struct DropCounters {
    pub duplicate_brokers: u64,
    pub duplicate_topics: u64,
    pub duplicate_partitions: u64,
    pub unknown_broker_partitions: u64,
}

struct BuildTopic {
    name: String,
    partitions: Vec<Partition>,
    ids_seen: HashSet<i32>,
}

/// Incrementally constructs a [`MetadataSnapshot`] the way a metadata
/// response is parsed: brokers first, then one topic at a time.
pub struct MetadataBuilder {
    logger: Logger,
    rng: SmallRng,
    brokers: Vec<Broker>,
    broker_id_to_index: HashMap<i32, usize>,
    broker_ids_seen: HashSet<i32>,
    topics: Vec<Topic>,
    topic_names_seen: HashSet<String>,
    open_topic: Option<BuildTopic>,
    counters: DropCounters,
    next_generation: u64,
}

impl MetadataBuilder {
    pub fn new(logger: Logger, next_generation: u64) -> MetadataBuilder {
        MetadataBuilder {
            logger,
            rng: SmallRng::from_entropy(),
            brokers: Vec::new(),
            broker_id_to_index: HashMap::new(),
            broker_ids_seen: HashSet::new(),
            topics: Vec::new(),
            topic_names_seen: HashSet::new(),
            open_topic: None,
            counters: DropCounters::default(),
            next_generation,
        }
    }

    #[cfg(test)]
    pub fn with_rng(mut self, rng: SmallRng) -> MetadataBuilder {
        self.rng = rng;
        self
    }

    pub fn counters(&self) -> &DropCounters {
        &self.counters
    }

    pub fn open_brokers(&mut self) {}

    pub fn add_broker(&mut self, id: i32, host: String, port: u16) -> bool {
        if !self.broker_ids_seen.insert(id) {
            self.counters.duplicate_brokers += 1;
            warn!(self.logger, "dropping duplicate broker"; "broker_id" => id);
            return false;
        }
        let index = self.brokers.len();
        self.broker_id_to_index.insert(id, index);
        self.brokers.push(Broker {
            id,
            host,
            port,
            in_service: false,
        });
        true
    }

    pub fn close_brokers(&mut self) {}

    pub fn open_topic(&mut self, name: &str) -> bool {
        if !self.topic_names_seen.insert(name.to_string()) {
            self.counters.duplicate_topics += 1;
            warn!(self.logger, "dropping duplicate topic"; "topic" => name);
            return false;
        }
        self.open_topic = Some(BuildTopic {
            name: name.to_string(),
            partitions: Vec::new(),
            ids_seen: HashSet::new(),
        });
        true
    }

    pub fn add_partition(&mut self, partition_id: i32, broker_id: i32, _can_send: bool, error_code: i16) {
        let broker_index = match self.broker_id_to_index.get(&broker_id) {
            Some(&idx) => idx,
            None => {
                self.counters.unknown_broker_partitions += 1;
                warn!(
                    self.logger,
                    "dropping partition with unknown broker (may occur when the sole-replica \
                     broker is down)";
                    "partition_id" => partition_id, "broker_id" => broker_id,
                );
                return;
            }
        };
        let topic = self.open_topic.as_mut().expect("add_partition without an open topic");
        if !topic.ids_seen.insert(partition_id) {
            self.counters.duplicate_partitions += 1;
            warn!(
                self.logger, "dropping duplicate partition";
                "topic" => &topic.name, "partition_id" => partition_id,
            );
            return;
        }
        topic.partitions.push(Partition {
            id: partition_id,
            broker_index,
            error_code,
        });
    }

    pub fn close_topic(&mut self) {
        let build = self.open_topic.take().expect("close_topic without an open topic");
        let mut ok_partitions = Vec::new();
        let mut out_of_service_partitions = Vec::new();
        for p in build.partitions.iter() {
            // Error code None (0) with a known leader means "ok"; anything
            // else (no leader elected, explicit error) is out of service.
            if p.error_code == 0 {
                ok_partitions.push(p.clone());
                self.brokers[p.broker_index].in_service = true;
            } else {
                out_of_service_partitions.push(p.clone());
            }
        }

        let mut all_partitions: Vec<Partition> = ok_partitions
            .iter()
            .cloned()
            .chain(out_of_service_partitions.iter().cloned())
            .collect();
        all_partitions.sort_by_key(|p| p.id);

        // Randomize round-robin order now; the ascending-id choice map is
        // derived separately (from a sorted copy) once broker indices are
        // renumbered in `build`, so shuffling here doesn't affect it.
        ok_partitions.shuffle(&mut self.rng);

        self.topics.push(Topic {
            name: build.name,
            ok_partitions,
            out_of_service_partitions,
            all_partitions,
            choice_map: HashMap::new(),
        });
    }

    fn build_choice_vecs(sorted_ok: &[Partition]) -> (Vec<i32>, HashMap<usize, (usize, usize)>) {
        // Not used directly: see `close_topic_impl` below which carries the
        // running offset across topics. Kept as an associated fn for the
        // per-topic slice computation only.
        let mut vec = Vec::new();
        let mut map = HashMap::new();
        let mut idx = 0;
        while idx < sorted_ok.len() {
            let broker_index = sorted_ok[idx].broker_index;
            let start = idx;
            while idx < sorted_ok.len() && sorted_ok[idx].broker_index == broker_index {
                idx += 1;
            }
            let offset = vec.len();
            vec.extend(sorted_ok[start..idx].iter().map(|p| p.id));
            map.insert(broker_index, (offset, idx - start));
        }
        (vec, map)
    }

    /// Moves brokers so in-service brokers precede out-of-service ones,
    /// rewrites every partition's broker index through the permutation, and
    /// flattens per-topic choice vectors into one `topic_broker_vec` with
    /// globally correct offsets.
    pub fn build(mut self) -> super::error::Result<MetadataSnapshot> {
        if self.brokers.is_empty() {
            return Err(crate::error::Error::NoBrokers);
        }

        let mut order: Vec<usize> = (0..self.brokers.len()).collect();
        order.sort_by_key(|&i| !self.brokers[i].in_service);
        let num_in_service = self.brokers.iter().filter(|b| b.in_service).count();

        let mut old_to_new = vec![0usize; self.brokers.len()];
        let mut new_brokers = Vec::with_capacity(self.brokers.len());
        for (new_idx, &old_idx) in order.iter().enumerate() {
            old_to_new[old_idx] = new_idx;
            new_brokers.push(self.brokers[old_idx].clone());
        }

        let mut topic_broker_vec = Vec::new();
        let mut topics = Vec::with_capacity(self.topics.len());
        for mut topic in self.topics.drain(..) {
            for p in topic.ok_partitions.iter_mut() {
                p.broker_index = old_to_new[p.broker_index];
            }
            for p in topic.out_of_service_partitions.iter_mut() {
                p.broker_index = old_to_new[p.broker_index];
            }
            for p in topic.all_partitions.iter_mut() {
                p.broker_index = old_to_new[p.broker_index];
            }

            // Recompute the choice map against the renumbered broker indices;
            // `ok_partitions` was shuffled for round-robin order but the
            // choice map must stay in ascending-id order per broker, so
            // derive it from a sorted copy, not the shuffled one.
            let mut sorted = topic.ok_partitions.clone();
            sorted.sort_by(|a, b| (a.broker_index, a.id).cmp(&(b.broker_index, b.id)));
            let (vec, map) = Self::build_choice_vecs(&sorted);
            let base = topic_broker_vec.len();
            topic_broker_vec.extend(vec);
            let shifted: HashMap<usize, (usize, usize)> =
                map.into_iter().map(|(k, (off, count))| (k, (off + base, count))).collect();
            topic.choice_map = shifted;
            topics.push(topic);
        }

        let topic_index = topics.iter().enumerate().map(|(i, t)| (t.name.clone(), i)).collect();
        let snapshot = MetadataSnapshot {
            brokers: new_brokers,
            num_in_service,
            topics,
            topic_index,
            topic_broker_vec,
            generation: self.next_generation,
        };
        snapshot
            .sanity_check()
            .map_err(crate::error::Error::MetadataInvariant)?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Discard;
    use slog::Logger;

    fn logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    fn small_rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn two_brokers_two_partitions() -> MetadataBuilder {
        let mut b = MetadataBuilder::new(logger(), 1).with_rng(small_rng());
        b.open_brokers();
        b.add_broker(1, "broker1".into(), 9092);
        b.add_broker(2, "broker2".into(), 9092);
        b.close_brokers();
        b.open_topic("scooby_doo");
        b.add_partition(0, 1, true, 0);
        b.add_partition(1, 1, true, 0);
        b.add_partition(2, 2, true, 0);
        b.add_partition(3, 2, true, 0);
        b.close_topic();
        b
    }

    #[test]
    fn sanity_check_passes_and_is_reflexive() {
        let snap = two_brokers_two_partitions().build().unwrap();
        assert!(snap.sanity_check().is_ok());
        assert_eq!(snap, snap.clone());
    }

    #[test]
    fn choice_slices_are_ascending_and_subset_of_ok() {
        let snap = two_brokers_two_partitions().build().unwrap();
        for broker_index in 0..snap.brokers().len() {
            if let Some(slice) = snap.find_partition_choices("scooby_doo", broker_index) {
                assert!(!slice.is_empty());
                assert!(slice.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn in_service_brokers_are_contiguous_prefix() {
        let mut b = MetadataBuilder::new(logger(), 1).with_rng(small_rng());
        b.open_brokers();
        b.add_broker(1, "a".into(), 9092);
        b.add_broker(2, "b".into(), 9092); // never gets an ok partition -> out of service
        b.close_brokers();
        b.open_topic("t");
        b.add_partition(0, 1, true, 0);
        b.close_topic();
        let snap = b.build().unwrap();
        assert_eq!(snap.num_in_service(), 1);
        assert!(snap.brokers()[0].in_service);
        assert!(!snap.brokers()[1].in_service);
    }

    #[test]
    fn equality_ignores_order_and_generation() {
        let mut a = MetadataBuilder::new(logger(), 1).with_rng(small_rng());
        a.open_brokers();
        a.add_broker(1, "a".into(), 9092);
        a.add_broker(2, "b".into(), 9092);
        a.close_brokers();
        a.open_topic("t");
        a.add_partition(0, 1, true, 0);
        a.add_partition(1, 2, true, 0);
        a.close_topic();
        let snap_a = a.build().unwrap();

        let mut b = MetadataBuilder::new(logger(), 2).with_rng(small_rng());
        b.open_brokers();
        b.add_broker(2, "b".into(), 9092);
        b.add_broker(1, "a".into(), 9092);
        b.close_brokers();
        b.open_topic("t");
        b.add_partition(1, 2, true, 0);
        b.add_partition(0, 1, true, 0);
        b.close_topic();
        let snap_b = b.build().unwrap();

        assert_eq!(snap_a, snap_b);
        assert_ne!(snap_a.generation, snap_b.generation);
    }

    #[test]
    fn duplicate_broker_is_dropped() {
        let mut b = MetadataBuilder::new(logger(), 1).with_rng(small_rng());
        b.open_brokers();
        assert!(b.add_broker(1, "a".into(), 9092));
        assert!(!b.add_broker(1, "a-dup".into(), 9092));
        b.close_brokers();
        b.open_topic("t");
        b.add_partition(0, 1, true, 0);
        b.close_topic();
        let snap = b.build().unwrap();
        assert_eq!(snap.brokers().len(), 1);
    }

    #[test]
    fn partition_with_unknown_broker_is_dropped() {
        let mut b = MetadataBuilder::new(logger(), 1).with_rng(small_rng());
        b.open_brokers();
        b.add_broker(1, "a".into(), 9092);
        b.close_brokers();
        b.open_topic("t");
        b.add_partition(0, 1, true, 0);
        b.add_partition(1, 99, true, 0); // unknown broker
        b.close_topic();
        let snap = b.build().unwrap();
        assert_eq!(snap.ok_partition_count(snap.topic_index("t").unwrap()), 1);
    }
}
