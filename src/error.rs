//! Errors returned by the relay core's setup and fatal paths.
//!
//! Per-message errors (bad topic, oversize payload, a broker NACK, ...) are
//! never represented here: they are recoverable and are turned into anomaly
//! records and counters (see [`crate::anomaly`]). This type is reserved for
//! configuration, construction and invariant-violation failures.

/// Crate-wide result alias.
pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no brokers configured")]
    NoBrokers,

    #[error("failed to build named config '{0}': {1}")]
    NamedConfig(String, String),

    #[error("failed to bind input gate: {0}")]
    BindFailed(#[source] ::std::io::Error),

    #[error("metadata fetch failed against every configured broker")]
    MetadataUnreachable,

    #[error("metadata sanity check failed: {0}")]
    MetadataInvariant(String),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("worker thread failed to start: {0}")]
    ThreadSpawn(#[source] ::std::io::Error),

    #[error("failed to read config file: {0}")]
    ConfigIo(#[source] ::std::io::Error),

    #[error("failed to parse config file: {0}")]
    ConfigParse(#[source] ::serde_yaml::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Error {
        Error::Config(msg.into())
    }

    pub fn fatal<S: Into<String>>(msg: S) -> Error {
        Error::Fatal(msg.into())
    }
}
