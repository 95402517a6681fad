//! The validated configuration record the core is handed.
//!
//! Parsing CLI args/config files is out of scope; this module only
//! owns the `serde`-deserializable shape plus the cross-field validation
//! the core defensively re-runs at construction.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::error::Result;

/// `disable`, or an enabled numeric bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Bound<T> {
    Disable(DisableTag),
    Value(T),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisableTag {
    Disable,
}

impl<T: Copy> Bound<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Bound::Disable(_) => None,
            Bound::Value(v) => Some(*v),
        }
    }
}

/// `(max_time_ms, max_messages, max_bytes)` named batching config.
#[derive(Clone, Debug, Deserialize)]
pub struct BatchNamedConfig {
    pub max_time_ms: Bound<u64>,
    pub max_messages: Bound<u64>,
    pub max_bytes: Bound<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Snappy,
    Gzip,
    Lz4,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CompressionNamedConfig {
    #[serde(rename = "type")]
    pub kind: CompressionType,
    pub min_size: usize,
    pub level: Option<u32>,
}

/// `(interval_ms, count | 0 | unlimited)`: `count == 0` is the "always rate
/// limited" sentinel, `Unlimited` disables the limiter.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RateNamedConfig {
    Unlimited(UnlimitedTag),
    Limited { interval_ms: u64, count: u64 },
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlimitedTag {
    Unlimited,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

/// Top-level, flat configuration record.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub initial_brokers: Vec<BrokerAddr>,

    pub produce_request_data_limit: usize,
    pub message_max_bytes: usize,

    pub batch_default: BatchNamedConfig,
    pub batch_topic_overrides: HashMap<String, BatchNamedConfig>,

    pub compression_default: Option<CompressionNamedConfig>,
    pub compression_topic_overrides: HashMap<String, CompressionNamedConfig>,
    /// 0-100; a batch only keeps its compressed form if compression shrinks
    /// it to at least this percentage of its original size.
    pub compression_size_threshold_percent: u32,

    pub rate_limit_default: RateNamedConfig,
    pub rate_limit_topic_overrides: HashMap<String, RateNamedConfig>,

    pub max_failed_delivery_attempts: u32,
    pub shutdown_max_delay_ms: u64,
    pub dispatcher_restart_max_delay_ms: u64,
    pub metadata_refresh_interval_min: u64,
    pub compare_metadata_on_refresh: bool,
    pub kafka_socket_timeout_s: u64,

    pub pause_rate_limit_initial_ms: u64,
    pub pause_rate_limit_max_double: u32,
    pub min_pause_delay_ms: u64,

    pub topic_autocreate: bool,
    pub required_acks: i16,
    pub replication_timeout_ms: i32,
    pub client_id: String,

    pub discard_report_interval_s: u64,
    pub bad_msg_prefix_size: usize,
}

/// Workaround for a bug in Kafka 0.9.0.0 that crashes the broker on receipt
/// of a produce request with an empty client id.
pub const DEFAULT_CLIENT_ID: &str = "kafka-relayd";

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.initial_brokers.is_empty() {
            return Err(Error::NoBrokers);
        }
        if self.produce_request_data_limit == 0 {
            return Err(Error::config("produce_request_data_limit must be > 0"));
        }
        if self.message_max_bytes == 0 || self.message_max_bytes > self.produce_request_data_limit {
            return Err(Error::config(
                "message_max_bytes must be > 0 and <= produce_request_data_limit",
            ));
        }
        if self.compression_size_threshold_percent > 100 {
            return Err(Error::config("compression_size_threshold_percent must be 0..=100"));
        }
        if self.required_acks < -1 {
            return Err(Error::config("required_acks must be >= -1"));
        }
        if self.replication_timeout_ms < 0 {
            return Err(Error::config("replication_timeout_ms must be >= 0"));
        }
        Ok(())
    }

    /// The client id with the 0.9.0.0 empty-string workaround applied.
    pub fn effective_client_id(&self) -> &str {
        if self.client_id.is_empty() {
            DEFAULT_CLIENT_ID
        } else {
            &self.client_id
        }
    }

    pub fn kafka_socket_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka_socket_timeout_s)
    }

    pub fn shutdown_max_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_max_delay_ms)
    }

    pub fn dispatcher_restart_max_delay(&self) -> Duration {
        Duration::from_millis(self.dispatcher_restart_max_delay_ms)
    }

    /// Loads and validates a config record from a YAML file. CLI/arg parsing
    /// is out of scope; this is the one entry point the binary
    /// uses, mirroring `replicante::config::Config::from_file`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let file = File::open(path).map_err(Error::ConfigIo)?;
        Config::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Config> {
        let config: Config = serde_yaml::from_reader(reader).map_err(Error::ConfigParse)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(any(test, feature = "with_test_support"))]
pub fn test_config() -> Config {
    Config {
        initial_brokers: vec![BrokerAddr { host: "localhost".into(), port: 9092 }],
        produce_request_data_limit: 1_000_000,
        message_max_bytes: 1_000_000,
        batch_default: BatchNamedConfig {
            max_time_ms: Bound::Value(1000),
            max_messages: Bound::Value(100),
            max_bytes: Bound::Value(100_000),
        },
        batch_topic_overrides: HashMap::new(),
        compression_default: None,
        compression_topic_overrides: HashMap::new(),
        compression_size_threshold_percent: 100,
        rate_limit_default: RateNamedConfig::Unlimited(UnlimitedTag::Unlimited),
        rate_limit_topic_overrides: HashMap::new(),
        max_failed_delivery_attempts: 3,
        shutdown_max_delay_ms: 5000,
        dispatcher_restart_max_delay_ms: 5000,
        metadata_refresh_interval_min: 15,
        compare_metadata_on_refresh: true,
        kafka_socket_timeout_s: 30,
        pause_rate_limit_initial_ms: 100,
        pause_rate_limit_max_double: 6,
        min_pause_delay_ms: 100,
        topic_autocreate: false,
        required_acks: 1,
        replication_timeout_ms: 10_000,
        client_id: String::new(),
        discard_report_interval_s: 60,
        bad_msg_prefix_size: 256,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_client_id_gets_workaround_default() {
        let mut cfg = test_config();
        cfg.client_id = String::new();
        assert_eq!(cfg.effective_client_id(), DEFAULT_CLIENT_ID);
        cfg.client_id = "custom".into();
        assert_eq!(cfg.effective_client_id(), "custom");
    }

    #[test]
    fn rejects_no_brokers() {
        let mut cfg = test_config();
        cfg.initial_brokers.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_message_max_bytes_over_request_limit() {
        let mut cfg = test_config();
        cfg.message_max_bytes = cfg.produce_request_data_limit + 1;
        assert!(cfg.validate().is_err());
    }
}
