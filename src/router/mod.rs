//! Top-level supervisor: bootstrap, per-message validation,
//! routing, periodic metadata refresh, pause handling and slow shutdown.
//! Single thread; its poll set is multiplexed with `crossbeam_channel::Select`
//! over several event channels, rather than a `poll(2)` array of raw file
//! descriptors.

mod metadata_fetch;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use arc_swap::ArcSwap;
use crossbeam_channel::Receiver;
use crossbeam_channel::Select;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use slog::Logger;

use crate::anomaly::AnomalyTracker;
use crate::batcher::Batch;
use crate::batcher::BatchConfigResolver;
use crate::batcher::TopicBatcher;
use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::message::DiscardReason;
use crate::message::Message;
use crate::message::RoutingType;
use crate::metadata::MetadataBuilder;
use crate::metadata::MetadataSnapshot;
use crate::msg_dispatch::dispatcher::Dispatcher;
use crate::msg_dispatch::dispatcher::DispatcherConfig;
use crate::msg_dispatch::request_factory::CompressionResolver;
use crate::msg_dispatch::response_processor::ResponseProcessor;
use crate::rate_limit::Backoff;
use crate::rate_limit::TopicRateLimiter;
use crate::sync::PushButton;
use crate::wire::AutocreateOutcome;
use crate::wire::KafkaWire;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// What the router returns once its main loop exits.
pub struct RouterOutcome {
    pub ok_shutdown: bool,
}

enum ShutdownPhase {
    Running,
    Finished,
}

/// Owns everything the router needs across its lifetime: the current
/// metadata, the live dispatcher generation, and the per-topic batching/
/// rate-limiting state that must survive a dispatcher restart.
pub struct Router {
    config: Config,
    wire: Arc<dyn KafkaWire>,
    logger: Logger,
    anomaly: Arc<AnomalyTracker>,
    response_processor: Arc<ResponseProcessor>,
    input_rx: Receiver<Message>,
    shutdown_button: PushButton,
    rng: SmallRng,

    metadata: ArcSwap<MetadataSnapshot>,
    next_generation: u64,
    next_broker_start: usize,

    batcher: TopicBatcher,
    rate_limiter: TopicRateLimiter,
    pause_backoff: Backoff,
    any_partition_counters: std::collections::HashMap<String, u64>,

    dispatcher: Option<Dispatcher>,
    phase: ShutdownPhase,
    next_refresh_at: Instant,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        wire: Arc<dyn KafkaWire>,
        logger: Logger,
        anomaly: Arc<AnomalyTracker>,
        input_rx: Receiver<Message>,
        shutdown_button: PushButton,
    ) -> Router {
        let batch_resolver = BatchConfigResolver::new(&config.batch_default, &config.batch_topic_overrides);
        let rate_limiter = TopicRateLimiter::new(&config.rate_limit_default, &config.rate_limit_topic_overrides);
        let response_processor = Arc::new(ResponseProcessor::new(config.max_failed_delivery_attempts, anomaly.clone()));
        let pause_backoff = Backoff::new(
            Duration::from_millis(config.pause_rate_limit_initial_ms),
            config.pause_rate_limit_max_double,
            Duration::from_millis(config.min_pause_delay_ms),
        );
        Router {
            batcher: TopicBatcher::new(batch_resolver, wire.single_msg_overhead()),
            rate_limiter,
            pause_backoff,
            any_partition_counters: std::collections::HashMap::new(),
            metadata: ArcSwap::new(Arc::new(empty_metadata())),
            next_generation: 1,
            next_broker_start: 0,
            dispatcher: None,
            phase: ShutdownPhase::Running,
            next_refresh_at: Instant::now(),
            config,
            wire,
            logger,
            anomaly,
            response_processor,
            input_rx,
            shutdown_button,
            rng: SmallRng::from_entropy(),
        }
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            wire: self.wire.clone(),
            client_id: self.config.effective_client_id().to_string(),
            required_acks: self.config.required_acks,
            replication_timeout_ms: self.config.replication_timeout_ms,
            produce_request_data_limit: self.config.produce_request_data_limit,
            message_max_bytes: self.config.message_max_bytes,
            compression: CompressionResolver::new(
                self.config.compression_default.as_ref(),
                &self.config.compression_topic_overrides,
                self.config.compression_size_threshold_percent,
            ),
            socket_timeout: self.config.kafka_socket_timeout(),
        }
    }

    /// Bootstrap: pick a random initial broker, fetch metadata,
    /// cycling through the rest on failure; bounded backoff with jitter
    /// across full-list failures, honouring shutdown requests meanwhile.
    fn bootstrap(&mut self) -> Result<()> {
        let start = self.rng.gen_range(0..self.config.initial_brokers.len());
        let mut backoff = Backoff::new(Duration::from_millis(500), 6, Duration::from_millis(500));
        loop {
            if let Some(raw) = metadata_fetch::fetch_metadata(
                &self.config.initial_brokers,
                start,
                self.wire.as_ref(),
                self.config.kafka_socket_timeout(),
                &self.logger,
            ) {
                self.apply_metadata(raw)?;
                return Ok(());
            }
            if self.shutdown_button.is_pushed() {
                return Err(Error::MetadataUnreachable);
            }
            let delay = backoff.next_delay(&mut self.rng);
            slog::warn!(self.logger, "bootstrap metadata fetch failed against every broker, backing off"; "delay_ms" => delay.as_millis() as u64);
            std::thread::sleep(delay);
        }
    }

    fn apply_metadata(&mut self, raw: crate::wire::RawMetadata) -> Result<()> {
        let mut builder = MetadataBuilder::new(self.logger.clone(), self.next_generation);
        self.next_generation += 1;
        builder.open_brokers();
        for broker in &raw.brokers {
            builder.add_broker(broker.id, broker.host.clone(), broker.port);
        }
        builder.close_brokers();
        for topic in &raw.topics {
            builder.open_topic(&topic.name);
            for partition in &topic.partitions {
                builder.add_partition(partition.id, partition.leader_broker_id, true, partition.error_code);
            }
            builder.close_topic();
        }
        let snapshot = builder.build()?;
        self.drop_dead_topics(&snapshot);
        self.metadata.store(Arc::new(snapshot));
        Ok(())
    }

    /// A topic that disappeared, or lost every partition, has its open batch
    /// flushed straight to discard rather than held forever.
    fn drop_dead_topics(&mut self, new_metadata: &MetadataSnapshot) {
        let current = self.metadata.load();
        let stale: Vec<String> = current
            .topic_names()
            .filter(|name| match new_metadata.topic_index(name) {
                Some(idx) => new_metadata.ok_partition_count(idx) == 0,
                None => true,
            })
            .map(str::to_string)
            .collect();
        drop(current);
        for topic in stale {
            let leftover = self.batcher.delete_topic(&topic);
            self.discard_all(leftover, DiscardReason::NoAvailablePartitions);
        }
    }

    fn discard_all(&self, messages: Vec<Message>, reason: DiscardReason) {
        for msg in messages {
            self.anomaly.discard(&msg, reason);
            crate::metrics::DISCARD_TOTAL.with_label_values(&[reason.as_str()]).inc();
        }
    }

    fn restart_dispatcher(&mut self) -> Result<()> {
        let config = self.dispatcher_config();
        let dispatcher = Dispatcher::start(self.metadata.load_full(), &config, self.response_processor.clone(), self.anomaly.clone(), &self.logger)?;
        self.dispatcher = Some(dispatcher);
        self.rearm_refresh_timer();
        Ok(())
    }

    fn rearm_refresh_timer(&mut self) {
        let mean_ms = self.config.metadata_refresh_interval_min.saturating_mul(60_000);
        let jitter_frac: f64 = self.rng.gen_range(-0.2..=0.2);
        let delay_ms = (mean_ms as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
        self.next_refresh_at = Instant::now() + Duration::from_millis(delay_ms);
    }

    /// Runs bootstrap then the main loop until shutdown completes.
    pub fn run(mut self) -> RouterOutcome {
        if let Err(error) = self.bootstrap() {
            slog::error!(self.logger, "router bootstrap failed"; "error" => %error);
            return RouterOutcome { ok_shutdown: false };
        }
        if let Err(error) = self.restart_dispatcher() {
            slog::error!(self.logger, "failed to start dispatcher"; "error" => %error);
            return RouterOutcome { ok_shutdown: false };
        }

        loop {
            if matches!(self.phase, ShutdownPhase::Finished) {
                break;
            }
            self.tick();
        }
        RouterOutcome { ok_shutdown: true }
    }

    /// One iteration of the main loop. The receivers registered with
    /// `Select` are cloned into locals first rather than borrowed straight
    /// from `self`: crossbeam's `Select`/`SelectedOperation` borrow whatever
    /// they're given for their whole lifetime, and the handlers below need
    /// `&mut self` to act on what they receive.
    fn tick(&mut self) {
        let wait = self.next_wake();
        let accepting_input = matches!(self.phase, ShutdownPhase::Running);

        let input_rx = self.input_rx.clone();
        let shutdown_rx = self.shutdown_button.receiver().clone();
        let pause_rx = self.dispatcher.as_ref().map(|d| d.get_pause_fd().clone());

        let mut sel = Select::new();
        let input_idx = if accepting_input { Some(sel.recv(&input_rx)) } else { None };
        let shutdown_idx = sel.recv(&shutdown_rx);
        let pause_idx = pause_rx.as_ref().map(|rx| sel.recv(rx));

        match sel.select_timeout(wait) {
            Ok(oper) => {
                let idx = oper.index();
                if Some(idx) == input_idx {
                    match oper.recv(&input_rx) {
                        Ok(msg) => self.handle_new_message(msg),
                        Err(_) => self.begin_slow_shutdown(),
                    }
                } else if idx == shutdown_idx {
                    let _ = oper.recv(&shutdown_rx);
                    self.shutdown_button.drain_one();
                    self.begin_slow_shutdown();
                } else if Some(idx) == pause_idx {
                    if let Some(rx) = &pause_rx {
                        let _ = oper.recv(rx);
                    }
                    self.handle_pause();
                }
            }
            Err(_) => self.on_timer(),
        };
    }

    fn next_wake(&self) -> Duration {
        let now = Instant::now();
        let mut wait = Duration::from_secs(1);
        if let Some(expiry_ms) = self.batcher.get_next_complete_time() {
            let remaining = expiry_ms.saturating_sub(now_ms());
            wait = wait.min(Duration::from_millis(remaining));
        }
        wait = wait.min(self.next_refresh_at.saturating_duration_since(now));
        wait.max(Duration::from_millis(1))
    }

    fn on_timer(&mut self) {
        let now = now_ms();
        let complete = self.batcher.get_complete(now);
        self.flush_batches(complete);

        if Instant::now() >= self.next_refresh_at && matches!(self.phase, ShutdownPhase::Running) {
            self.refresh_metadata();
        }
    }

    /// On a refresh tick, re-fetch; if unchanged and comparison is enabled,
    /// just re-arm. Otherwise restart the dispatcher generation and re-route
    /// whatever it had in flight.
    fn refresh_metadata(&mut self) {
        let raw = match metadata_fetch::fetch_metadata(
            &self.config.initial_brokers,
            self.next_broker_start,
            self.wire.as_ref(),
            self.config.kafka_socket_timeout(),
            &self.logger,
        ) {
            Some(r) => r,
            None => {
                slog::warn!(self.logger, "metadata refresh failed against every broker, will retry next tick");
                self.rearm_refresh_timer();
                return;
            }
        };
        let mut builder = MetadataBuilder::new(self.logger.clone(), self.next_generation);
        builder.open_brokers();
        for broker in &raw.brokers {
            builder.add_broker(broker.id, broker.host.clone(), broker.port);
        }
        builder.close_brokers();
        for topic in &raw.topics {
            builder.open_topic(&topic.name);
            for partition in &topic.partitions {
                builder.add_partition(partition.id, partition.leader_broker_id, true, partition.error_code);
            }
            builder.close_topic();
        }
        let candidate = match builder.build() {
            Ok(s) => s,
            Err(error) => {
                slog::error!(self.logger, "new metadata failed sanity check, keeping current generation"; "error" => %error);
                self.rearm_refresh_timer();
                return;
            }
        };

        if !self.config.compare_metadata_on_refresh || candidate != **self.metadata.load() {
            self.next_generation += 1;
            self.drop_dead_topics(&candidate);
            self.metadata.store(Arc::new(candidate));
            self.cycle_dispatcher();
        } else {
            self.rearm_refresh_timer();
        }
    }

    /// Fast-shutdown the current dispatcher generation, collect its residual
    /// messages, start a fresh generation on the current metadata, and
    /// re-route the residual.
    fn cycle_dispatcher(&mut self) {
        crate::metrics::DISPATCHER_RESTART_TOTAL.with_label_values(&["metadata_refresh"]).inc();
        let deadline = Instant::now() + self.config.dispatcher_restart_max_delay();
        let residual = match self.dispatcher.take() {
            Some(d) => {
                d.start_fast_shutdown(deadline);
                d.join_all(&self.logger)
            }
            None => Vec::new(),
        };
        if let Err(error) = self.restart_dispatcher() {
            slog::error!(self.logger, "failed to restart dispatcher"; "error" => %error);
        }
        self.reroute(residual);
    }

    /// Pause handling: rate-limit, then the same fast-shutdown/refresh/
    /// restart/reroute cycle as a metadata refresh.
    fn handle_pause(&mut self) {
        crate::metrics::PAUSE_TOTAL.with_label_values(&["connector_pause"]).inc();
        let delay = self.pause_backoff.next_delay(&mut self.rng);
        std::thread::sleep(delay);

        let deadline = Instant::now() + self.config.dispatcher_restart_max_delay();
        let residual = match self.dispatcher.take() {
            Some(d) => {
                d.start_fast_shutdown(deadline);
                d.join_all(&self.logger)
            }
            None => Vec::new(),
        };

        if let Some(raw) = metadata_fetch::fetch_metadata(
            &self.config.initial_brokers,
            self.next_broker_start,
            self.wire.as_ref(),
            self.config.kafka_socket_timeout(),
            &self.logger,
        ) {
            if self.apply_metadata(raw).is_err() {
                slog::error!(self.logger, "post-pause metadata failed sanity check, keeping current generation");
            }
        } else {
            slog::warn!(self.logger, "post-pause metadata refetch failed against every broker, reusing current generation");
        }

        if let Err(error) = self.restart_dispatcher() {
            slog::error!(self.logger, "failed to restart dispatcher after pause"; "error" => %error);
        }
        self.reroute(residual);
    }

    /// Slow shutdown: stop accepting new input, drain what's queued plus
    /// every open batch, then block on the dispatcher finishing
    /// its own `Phase::SlowShutdown` deadline (each connector enforces the
    /// deadline itself; the router just waits for `join_all` to return).
    fn begin_slow_shutdown(&mut self) {
        if !matches!(self.phase, ShutdownPhase::Running) {
            return;
        }
        let deadline = Instant::now() + self.config.shutdown_max_delay();

        while let Ok(msg) = self.input_rx.try_recv() {
            self.handle_new_message(msg);
        }
        let drained = self.batcher.drain_all();
        self.flush_batches(drained);

        if let Some(d) = self.dispatcher.take() {
            d.start_slow_shutdown(deadline);
            let residual = d.join_all(&self.logger);
            self.discard_all(residual, DiscardReason::ServerShutdown);
        }
        self.phase = ShutdownPhase::Finished;
    }

    fn handle_new_message(&mut self, msg: Message) {
        if let Some(msg) = self.validate(msg) {
            for batch in self.batcher.add(msg, now_ms()) {
                self.route_batch(batch);
            }
        }
    }

    /// Validates one incoming message against current metadata, discarding
    /// it (and returning `None`) on any failure; otherwise hands it back for
    /// batching.
    fn validate(&mut self, mut msg: Message) -> Option<Message> {
        if self.metadata.load().topic_index(&msg.topic).is_none() {
            if self.config.topic_autocreate {
                if !self.autocreate_and_wait(&msg.topic) {
                    self.anomaly.discard(&msg, DiscardReason::FailedTopicAutocreate);
                    crate::metrics::DISCARD_TOTAL.with_label_values(&[DiscardReason::FailedTopicAutocreate.as_str()]).inc();
                    return None;
                }
            }
            if self.metadata.load().topic_index(&msg.topic).is_none() {
                self.anomaly.discard(&msg, DiscardReason::BadTopic);
                crate::metrics::DISCARD_TOTAL.with_label_values(&[DiscardReason::BadTopic.as_str()]).inc();
                return None;
            }
        }

        let single_msg_overhead = self.wire.single_msg_overhead();
        if msg.body_truncated || msg.wire_size(single_msg_overhead) > self.config.message_max_bytes {
            self.anomaly.discard(&msg, DiscardReason::LongMsg);
            crate::metrics::DISCARD_TOTAL.with_label_values(&[DiscardReason::LongMsg.as_str()]).inc();
            return None;
        }

        let topic_idx = self.metadata.load().topic_index(&msg.topic).expect("checked above");
        if self.metadata.load().ok_partition_count(topic_idx) == 0 {
            self.anomaly.discard(&msg, DiscardReason::NoAvailablePartitions);
            crate::metrics::DISCARD_TOTAL.with_label_values(&[DiscardReason::NoAvailablePartitions.as_str()]).inc();
            return None;
        }

        if self.rate_limiter.is_rate_limited(&msg.topic, msg.timestamp_ms) {
            self.anomaly.rate_limited();
            self.anomaly.discard(&msg, DiscardReason::RateLimit);
            crate::metrics::DISCARD_TOTAL.with_label_values(&[DiscardReason::RateLimit.as_str()]).inc();
            return None;
        }

        msg.partition = None;
        Some(msg)
    }

    /// Topic autocreate: request creation, then wait up to three
    /// exponentially increasing intervals for a refreshed metadata
    /// snapshot to show the topic. Returns false only when autocreate
    /// itself failed outright (exhausted brokers or an explicit `Fail`);
    /// a topic that still doesn't appear after the waits is logged and the
    /// caller re-checks metadata itself, falling through to a plain
    /// BadTopic discard.
    fn autocreate_and_wait(&mut self, topic: &str) -> bool {
        let outcome = metadata_fetch::autocreate_topic(
            &self.config.initial_brokers,
            self.next_broker_start,
            topic,
            self.wire.as_ref(),
            self.config.kafka_socket_timeout(),
            &self.logger,
        );
        match outcome {
            Some(AutocreateOutcome::Success) => {}
            _ => return false,
        }

        let mut sleep_ms = 3000u64;
        for attempt in 0..3 {
            std::thread::sleep(Duration::from_millis(sleep_ms));
            if let Some(raw) = metadata_fetch::fetch_metadata(
                &self.config.initial_brokers,
                self.next_broker_start,
                self.wire.as_ref(),
                self.config.kafka_socket_timeout(),
                &self.logger,
            ) {
                let _ = self.apply_metadata(raw);
            }
            if self.metadata.load().topic_index(topic).is_some() {
                return true;
            }
            if attempt < 2 {
                sleep_ms *= 2;
            }
        }
        slog::warn!(self.logger, "newly created topic does not appear in metadata after retries"; "topic" => topic);
        true
    }

    /// Dispatches a completed batch: `AnyPartition` messages in the batch share
    /// one broker choice; `PartitionKey` messages are assigned individually
    /// since each key can land on a different partition.
    fn route_batch(&mut self, batch: Batch) {
        let topic = batch.topic.clone();
        let (any_partition, keyed): (Vec<Message>, Vec<Message>) =
            batch.messages.into_iter().partition(|m| matches!(m.routing, RoutingType::AnyPartition));

        if !any_partition.is_empty() {
            match self.choose_any_partition_broker(&topic) {
                Some(broker_index) => {
                    for msg in any_partition {
                        if let Err(msg) = self.dispatch(msg, broker_index) {
                            self.anomaly.discard(&msg, DiscardReason::NoAvailablePartitions);
                        }
                    }
                }
                None => self.discard_all(any_partition, DiscardReason::NoAvailablePartitions),
            }
        }

        for msg in keyed {
            let key = match msg.routing {
                RoutingType::PartitionKey(k) => k,
                RoutingType::AnyPartition => unreachable!(),
            };
            match self.choose_partition_key_broker(&topic, key) {
                Some((partition_id, broker_index)) => {
                    let mut msg = msg;
                    msg.partition = Some(partition_id);
                    if let Err(msg) = self.dispatch(msg, broker_index) {
                        self.anomaly.discard(&msg, DiscardReason::NoAvailablePartitions);
                    }
                }
                None => self.discard_all(vec![msg], DiscardReason::NoAvailablePartitions),
            }
        }
    }

    fn dispatch(&self, msg: Message, broker_index: usize) -> ::std::result::Result<(), Message> {
        match &self.dispatcher {
            Some(d) => d.dispatch(msg, broker_index),
            None => Err(msg),
        }
    }

    /// AnyPartition routing: round-robin `ok_partitions[counter mod n]` and
    /// dispatch to the partition's leader broker.
    fn choose_any_partition_broker(&mut self, topic: &str) -> Option<usize> {
        let metadata = self.metadata.load();
        let topic_idx = metadata.topic_index(topic)?;
        let counter = self.any_partition_counters.entry(topic.to_string()).or_insert(0);
        let partition_id = metadata.ok_partition_at(topic_idx, *counter)?;
        *counter = counter.wrapping_add(1);
        metadata.broker_for_partition(topic_idx, partition_id)
    }

    /// PartitionKey routing: probe `all_partitions[key mod n]`, scanning
    /// forward for the first in-service partition on a miss.
    fn choose_partition_key_broker(&mut self, topic: &str, key: i32) -> Option<(i32, usize)> {
        let metadata = self.metadata.load();
        let topic_idx = metadata.topic_index(topic)?;
        let all: Vec<i32> = metadata.all_partition_ids(topic_idx).collect();
        if all.is_empty() {
            return None;
        }
        let start = (key as u32 as usize) % all.len();
        for offset in 0..all.len() {
            let partition_id = all[(start + offset) % all.len()];
            if metadata.partition_in_service(topic_idx, partition_id) {
                let broker_index = metadata.broker_for_partition(topic_idx, partition_id)?;
                return Some((partition_id, broker_index));
            }
        }
        None
    }

    /// Re-validates a batch of re-surfaced messages (after a pause or
    /// refresh) against current metadata before handing them back to
    /// routing.
    fn reroute(&mut self, messages: Vec<Message>) {
        let mut by_topic: std::collections::HashMap<String, Vec<Message>> = std::collections::HashMap::new();
        for msg in messages {
            by_topic.entry(msg.topic.clone()).or_default().push(msg);
        }
        for (topic, msgs) in by_topic {
            let topic_idx = match self.metadata.load().topic_index(&topic) {
                Some(idx) => idx,
                None => {
                    self.discard_all(msgs, DiscardReason::BadTopic);
                    continue;
                }
            };
            if self.metadata.load().ok_partition_count(topic_idx) == 0 {
                self.discard_all(msgs, DiscardReason::NoAvailablePartitions);
                continue;
            }
            self.route_batch(Batch::from_messages(topic, msgs));
        }
    }

    fn flush_batches(&mut self, batches: Vec<Batch>) {
        for batch in batches {
            crate::metrics::BATCH_EMITTED_TOTAL.with_label_values(&[batch.topic.as_str()]).inc();
            self.route_batch(batch);
        }
    }
}

fn empty_metadata() -> MetadataSnapshot {
    let mut b = MetadataBuilder::new(Logger::root(slog::Discard, slog::o!()), 0);
    b.open_brokers();
    b.add_broker(-1, String::new(), 0);
    b.close_brokers();
    b.build().expect("single-placeholder-broker metadata is always valid")
}
