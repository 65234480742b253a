//! Delay-capable broker adapter
//!
//! This crate realises publish / consume / requeue-with-delay on top of a
//! partitioned append-only log that has no native scheduling:
//! - [`LogBackend`]: the log itself (in-memory or Kafka)
//! - [`Broker`]: durable readers, delay lanes and the dead-letter publish path
//! - [`lane`]: deterministic naming of delay lanes and their consumer groups

pub mod backend;
mod broker;
mod config;
mod error;
pub mod lane;

pub use backend::{LaneReader, LogBackend, MemoryLog, Record, StartFrom};
#[cfg(feature = "kafka")]
pub use backend::KafkaLog;
pub use broker::{Broker, EventHandler, HandlerError};
pub use config::{BackendConfig, BrokerConfig, DelayConfig, DelayMode, KafkaConfig, LaneConfig};
pub use error::{BrokerError, Result};
