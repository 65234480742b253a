use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    ClientConfig, Message, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use tracing::{debug, info};

use super::{LaneReader, LogBackend, Record, StartFrom};
use crate::{BrokerError, KafkaConfig};

/// Kafka-backed log
///
/// Producer:
/// - `acks=all`: wait for all in-sync replicas
/// - `enable.idempotence=true`: no duplicates from producer retries
///
/// Consumers:
/// - `enable.auto.commit=false`: positions move only on [`LaneReader::commit`]
/// - `allow.auto.create.topics=true`: delay lanes are created on first use
/// - held partitions are paused and rewound, so a reader keeps polling while
///   it waits on a record that is not yet due
pub struct KafkaLog {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl std::fmt::Debug for KafkaLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaLog")
            .field("brokers", &self.config.brokers)
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

impl KafkaLog {
    /// Create the shared producer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the client cannot be created.
    pub fn connect(config: &KafkaConfig) -> crate::Result<Self> {
        info!(brokers = %config.brokers, client_id = %config.client_id, "Initializing Kafka producer");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", config.send_timeout_ms.to_string())
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create Kafka producer: {e}")))?;

        Ok(Self {
            producer,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl LogBackend for KafkaLog {
    async fn append(&self, lane: &str, key: &str, payload: &[u8]) -> crate::Result<()> {
        let timestamp = epoch_millis().to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "source",
                value: Some(self.config.client_id.as_str()),
            })
            .insert(Header {
                key: "timestamp",
                value: Some(timestamp.as_str()),
            });

        let record = FutureRecord::to(lane)
            .key(key)
            .payload(payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(
                record,
                Timeout::After(Duration::from_millis(self.config.send_timeout_ms)),
            )
            .await
            .map_err(|(e, _)| BrokerError::Publish {
                lane: lane.to_string(),
                reason: e.to_string(),
            })?;

        debug!(lane = %lane, partition, offset, "Record appended to Kafka");
        Ok(())
    }

    async fn subscribe(
        &self,
        lane: &str,
        group: &str,
        start: StartFrom,
    ) -> crate::Result<Box<dyn LaneReader>> {
        let reset = match start {
            StartFrom::Earliest => "earliest",
            StartFrom::Latest => "latest",
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", &self.config.client_id)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset)
            .set("allow.auto.create.topics", "true")
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.config.max_poll_interval_ms.to_string(),
            )
            .create()
            .map_err(|e| BrokerError::Consume {
                lane: lane.to_string(),
                reason: e.to_string(),
            })?;

        consumer.subscribe(&[lane]).map_err(|e| BrokerError::Consume {
            lane: lane.to_string(),
            reason: e.to_string(),
        })?;

        info!(lane = %lane, group = %group, "Kafka consumer subscribed");

        Ok(Box::new(KafkaLaneReader {
            consumer,
            lane: lane.to_string(),
        }))
    }
}

fn epoch_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

struct KafkaLaneReader {
    consumer: StreamConsumer,
    lane: String,
}

#[async_trait]
impl LaneReader for KafkaLaneReader {
    async fn next(&mut self) -> crate::Result<Record> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| BrokerError::Consume {
                lane: self.lane.clone(),
                reason: e.to_string(),
            })?;

        Ok(Record {
            lane: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned())
                .unwrap_or_default(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn commit(&mut self, record: &Record) -> crate::Result<()> {
        let mut positions = TopicPartitionList::new();
        positions
            .add_partition_offset(&record.lane, record.partition, Offset::Offset(record.offset + 1))
            .and_then(|()| self.consumer.commit(&positions, CommitMode::Async))
            .map_err(|e| BrokerError::Consume {
                lane: self.lane.clone(),
                reason: format!("commit failed: {e}"),
            })
    }

    async fn hold(&mut self, record: &Record) -> crate::Result<()> {
        let mut partition = TopicPartitionList::new();
        partition.add_partition(&record.lane, record.partition);

        self.consumer
            .pause(&partition)
            .and_then(|()| {
                self.consumer.seek(
                    &record.lane,
                    record.partition,
                    Offset::Offset(record.offset),
                    Duration::from_secs(5),
                )
            })
            .map_err(|e| BrokerError::Consume {
                lane: self.lane.clone(),
                reason: format!("hold failed: {e}"),
            })
    }

    async fn resume(&mut self, partition: i32) -> crate::Result<()> {
        let mut held = TopicPartitionList::new();
        held.add_partition(&self.lane, partition);

        self.consumer
            .resume(&held)
            .map_err(|e| BrokerError::Consume {
                lane: self.lane.clone(),
                reason: format!("resume failed: {e}"),
            })
    }
}
