//! Broker configuration.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{LogBackend, MemoryLog, StartFrom};

const fn default_partitions() -> u32 {
    3
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_reader_backoff_ms() -> u64 {
    1_000
}

const fn default_send_timeout_ms() -> u64 {
    5_000
}

const fn default_session_timeout_ms() -> u64 {
    30_000
}

const fn default_max_poll_interval_ms() -> u64 {
    300_000
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "courier".to_string()
}

fn default_main_lane() -> String {
    "send-email-topic".to_string()
}

fn default_dead_letter_lane() -> String {
    "failed-email-topic".to_string()
}

fn default_group_id() -> String {
    "email-service-group".to_string()
}

/// How a delay lane reader treats an event that is not yet due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayMode {
    /// Re-append the record to the delay lane and pause for the poll interval.
    Republish,
    /// Hold the record's partition (uncommitted) until the record is due while
    /// the other partitions keep being read, then forward and commit it.
    #[default]
    Park,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default)]
    pub mode: DelayMode,

    /// Pause between checks of a not-yet-due record (in milliseconds)
    ///
    /// Bounds the precision of every delay from below.
    ///
    /// Default: 1000
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            mode: DelayMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl DelayConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Names of the lanes and consumer group used by the delivery worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    #[serde(default = "default_main_lane")]
    pub main: String,

    #[serde(default = "default_dead_letter_lane")]
    pub dead_letter: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            main: default_main_lane(),
            dead_letter: default_dead_letter_lane(),
            group_id: default_group_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers
    #[serde(default = "default_brokers")]
    pub brokers: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Producer delivery timeout (in milliseconds)
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Longest gap between two polls before a reader is evicted from its group
    /// (in milliseconds)
    ///
    /// Delay readers never block on a record that is not yet due: they pause its
    /// partition and keep polling at least every `delay.poll_interval_ms`, so
    /// this only has to exceed the poll interval and the time one handler call
    /// takes, not the longest delay.
    ///
    /// Default: 300000
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: default_client_id(),
            send_timeout_ms: default_send_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendConfig {
    /// In-process log, lost on restart.
    Memory {
        #[serde(default = "default_partitions")]
        partitions: u32,
    },
    Kafka(KafkaConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Memory {
            partitions: default_partitions(),
        }
    }
}

impl BackendConfig {
    /// Connect to the configured log.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be created, or if Kafka was requested from a
    /// build without the `kafka` feature.
    pub fn build(&self) -> crate::Result<Arc<dyn LogBackend>> {
        match self {
            Self::Memory { partitions } => Ok(Arc::new(MemoryLog::new(*partitions))),
            #[cfg(feature = "kafka")]
            Self::Kafka(config) => Ok(Arc::new(crate::KafkaLog::connect(config)?)),
            #[cfg(not(feature = "kafka"))]
            Self::Kafka(_) => Err(crate::BrokerError::Configuration(
                "Kafka backend requested but courier-broker was built without the `kafka` feature"
                    .to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub lanes: LaneConfig,

    #[serde(default)]
    pub delay: DelayConfig,

    /// Where a consumer group without a committed position starts reading
    #[serde(default)]
    pub start_from: StartFrom,

    /// Pause after a failed read before a reader tries again (in milliseconds)
    #[serde(default = "default_reader_backoff_ms")]
    pub reader_backoff_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            lanes: LaneConfig::default(),
            delay: DelayConfig::default(),
            start_from: StartFrom::default(),
            reader_backoff_ms: default_reader_backoff_ms(),
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub const fn reader_backoff(&self) -> Duration {
        Duration::from_millis(self.reader_backoff_ms)
    }
}
