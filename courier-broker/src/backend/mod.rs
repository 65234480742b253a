//! Log backends for the broker adapter
//!
//! - `memory`: in-process partitioned log for tests and single-process runs
//! - `kafka`: Apache Kafka via `rdkafka` (behind the `kafka` feature)

#[cfg(feature = "kafka")]
mod kafka;
mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(feature = "kafka")]
pub use kafka::KafkaLog;
pub use memory::MemoryLog;
use serde::{Deserialize, Serialize};

/// One entry read back from a lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub lane: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Where a consumer group with no committed position begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartFrom {
    #[default]
    Earliest,
    Latest,
}

/// A partitioned, append-only log with consumer-group positions.
///
/// Records with the same key land in the same partition and are read back
/// in append order. Nothing is ever scheduled; delay is built on top.
#[async_trait]
pub trait LogBackend: Send + Sync + Debug {
    /// Append `payload` to `lane`, creating the lane when it does not exist.
    async fn append(&self, lane: &str, key: &str, payload: &[u8]) -> crate::Result<()>;

    /// Open a reader for `group` on `lane`, resuming from the group's committed
    /// position when there is one.
    async fn subscribe(
        &self,
        lane: &str,
        group: &str,
        start: StartFrom,
    ) -> crate::Result<Box<dyn LaneReader>>;
}

#[async_trait]
pub trait LaneReader: Send {
    /// Wait for the next unseen record.
    ///
    /// Must be cancellation safe: dropping the future loses no record.
    async fn next(&mut self) -> crate::Result<Record>;

    /// Mark `record` as processed for this reader's group.
    async fn commit(&mut self, record: &Record) -> crate::Result<()>;

    /// Rewind `record`'s partition to `record` and stop reading from it until
    /// [`resume`](Self::resume) is called. Other partitions keep flowing.
    async fn hold(&mut self, record: &Record) -> crate::Result<()>;

    /// Read a held partition again, starting with the record it was held at.
    async fn resume(&mut self, partition: i32) -> crate::Result<()>;
}
