//! Discard/duplicate/anomaly accounting.
//!
//! A single mutex guards short critical sections only: one small struct
//! behind one lock, rather than many fine-grained locks, since every update
//! here is a quick counter bump.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::message::DiscardReason;
use crate::message::Message;

const MAX_EXAMPLES_PER_REASON: usize = 10;

#[derive(Clone, Debug, Default)]
pub struct DiscardExample {
    pub topic: String,
    pub value_prefix: Vec<u8>,
}

/// Sink for discard events consumed by the out-of-scope discard-file logger
///. Default is a no-op.
pub trait DiscardSink: Send + Sync {
    fn on_discard(&self, _reason: DiscardReason, _example: &DiscardExample) {}
}

pub struct NullDiscardSink;
impl DiscardSink for NullDiscardSink {}

#[derive(Clone, Debug, Default)]
pub struct AnomalyWindow {
    pub discards: HashMap<&'static str, u64>,
    pub discard_examples: HashMap<&'static str, Vec<DiscardExample>>,
    pub duplicates_by_topic: HashMap<String, u64>,
    pub bad_topics: HashMap<String, u64>,
    pub malformed_msg_count: u64,
    pub unsupported_version_count: u64,
    pub unix_stream_unclean_disconnect_count: u64,
    pub tcp_unclean_disconnect_count: u64,
    pub rate_limited_count: u64,
}

struct Inner {
    current: AnomalyWindow,
    previous: AnomalyWindow,
    window_started_at: Instant,
}

/// Counts and bounded recent-examples lists, rotated every
/// `discard_report_interval_s`; the status surface reads
/// current-plus-previous.
pub struct AnomalyTracker {
    inner: Mutex<Inner>,
    rotation_interval: Duration,
    bad_msg_prefix_size: usize,
    sink: Box<dyn DiscardSink>,
}

impl AnomalyTracker {
    pub fn new(rotation_interval: Duration, bad_msg_prefix_size: usize) -> AnomalyTracker {
        AnomalyTracker::with_sink(rotation_interval, bad_msg_prefix_size, Box::new(NullDiscardSink))
    }

    pub fn with_sink(rotation_interval: Duration, bad_msg_prefix_size: usize, sink: Box<dyn DiscardSink>) -> AnomalyTracker {
        AnomalyTracker {
            inner: Mutex::new(Inner {
                current: AnomalyWindow::default(),
                previous: AnomalyWindow::default(),
                window_started_at: Instant::now(),
            }),
            rotation_interval,
            bad_msg_prefix_size,
            sink,
        }
    }

    fn maybe_rotate(&self, inner: &mut Inner) {
        if inner.window_started_at.elapsed() >= self.rotation_interval {
            inner.previous = std::mem::take(&mut inner.current);
            inner.window_started_at = Instant::now();
        }
    }

    pub fn discard(&self, msg: &Message, reason: DiscardReason) {
        let example = DiscardExample {
            topic: msg.topic.clone(),
            value_prefix: msg.value_prefix(self.bad_msg_prefix_size),
        };
        let mut inner = self.inner.lock().expect("AnomalyTracker poisoned");
        self.maybe_rotate(&mut inner);
        *inner.current.discards.entry(reason.as_str()).or_insert(0) += 1;
        if reason == DiscardReason::BadTopic {
            *inner.current.bad_topics.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        let examples = inner.current.discard_examples.entry(reason.as_str()).or_default();
        if examples.len() < MAX_EXAMPLES_PER_REASON {
            examples.push(example.clone());
        }
        self.sink.on_discard(reason, &example);
    }

    pub fn duplicate(&self, topic: &str) {
        let mut inner = self.inner.lock().expect("AnomalyTracker poisoned");
        self.maybe_rotate(&mut inner);
        *inner.current.duplicates_by_topic.entry(topic.to_string()).or_insert(0) += 1;
    }

    pub fn malformed_input(&self) {
        let mut inner = self.inner.lock().expect("AnomalyTracker poisoned");
        self.maybe_rotate(&mut inner);
        inner.current.malformed_msg_count += 1;
    }

    pub fn unsupported_version(&self) {
        let mut inner = self.inner.lock().expect("AnomalyTracker poisoned");
        self.maybe_rotate(&mut inner);
        inner.current.unsupported_version_count += 1;
    }

    pub fn unclean_disconnect(&self, transport: Transport) {
        let mut inner = self.inner.lock().expect("AnomalyTracker poisoned");
        self.maybe_rotate(&mut inner);
        match transport {
            Transport::UnixStream => inner.current.unix_stream_unclean_disconnect_count += 1,
            Transport::Tcp => inner.current.tcp_unclean_disconnect_count += 1,
        }
    }

    pub fn rate_limited(&self) {
        let mut inner = self.inner.lock().expect("AnomalyTracker poisoned");
        self.maybe_rotate(&mut inner);
        inner.current.rate_limited_count += 1;
    }

    /// A merged current+previous snapshot, for the status surface.
    pub fn snapshot(&self) -> AnomalyWindow {
        let inner = self.inner.lock().expect("AnomalyTracker poisoned");
        merge_windows(&inner.previous, &inner.current)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Transport {
    UnixStream,
    Tcp,
}

fn merge_windows(previous: &AnomalyWindow, current: &AnomalyWindow) -> AnomalyWindow {
    let mut merged = previous.clone();
    for (k, v) in &current.discards {
        *merged.discards.entry(k).or_insert(0) += v;
    }
    for (k, v) in &current.duplicates_by_topic {
        *merged.duplicates_by_topic.entry(k.clone()).or_insert(0) += v;
    }
    for (k, v) in &current.bad_topics {
        *merged.bad_topics.entry(k.clone()).or_insert(0) += v;
    }
    for (k, examples) in &current.discard_examples {
        merged.discard_examples.entry(k).or_default().extend(examples.clone());
    }
    merged.malformed_msg_count += current.malformed_msg_count;
    merged.unsupported_version_count += current.unsupported_version_count;
    merged.unix_stream_unclean_disconnect_count += current.unix_stream_unclean_disconnect_count;
    merged.tcp_unclean_disconnect_count += current.tcp_unclean_disconnect_count;
    merged.rate_limited_count += current.rate_limited_count;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RoutingType;

    fn msg(topic: &str) -> Message {
        Message::new(topic.into(), None, b"hello".to_vec(), 0, RoutingType::AnyPartition)
    }

    #[test]
    fn discard_increments_counter_and_records_example() {
        let tracker = AnomalyTracker::new(Duration::from_secs(60), 256);
        tracker.discard(&msg("bad"), DiscardReason::BadTopic);
        let snap = tracker.snapshot();
        assert_eq!(snap.discards[&"bad_topic"], 1);
        assert_eq!(snap.bad_topics["bad"], 1);
        assert_eq!(snap.discard_examples[&"bad_topic"].len(), 1);
    }

    #[test]
    fn duplicate_is_tracked_per_topic() {
        let tracker = AnomalyTracker::new(Duration::from_secs(60), 256);
        tracker.duplicate("t");
        tracker.duplicate("t");
        assert_eq!(tracker.snapshot().duplicates_by_topic["t"], 2);
    }

    #[test]
    fn examples_are_bounded() {
        let tracker = AnomalyTracker::new(Duration::from_secs(60), 256);
        for _ in 0..(MAX_EXAMPLES_PER_REASON + 5) {
            tracker.discard(&msg("bad"), DiscardReason::BadTopic);
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.discard_examples[&"bad_topic"].len(), MAX_EXAMPLES_PER_REASON);
        assert_eq!(snap.discards[&"bad_topic"], (MAX_EXAMPLES_PER_REASON + 5) as u64);
    }
}
