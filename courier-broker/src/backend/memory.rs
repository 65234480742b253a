use std::{
    collections::{HashMap, HashSet},
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{LaneReader, LogBackend, Record, StartFrom};
use crate::BrokerError;

#[derive(Debug)]
struct Stored {
    key: String,
    payload: Arc<[u8]>,
}

#[derive(Debug, Default)]
struct Inner {
    lanes: HashMap<String, Vec<Vec<Stored>>>,
    /// Next offset to read per partition, keyed by `(group, lane)`
    committed: HashMap<(String, String), Vec<i64>>,
}

/// In-memory partitioned log
///
/// Lanes are created on first append or subscribe, each with a fixed number of
/// partitions. Consumer-group positions survive reader restarts for the
/// lifetime of the log, which makes readers resumable exactly as they are
/// against a real broker.
///
/// The log can be switched unavailable to exercise connection failures.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    partitions: u32,
    available: Arc<AtomicBool>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryLog {
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            partitions: partitions.max(1),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the log going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Every record currently stored in `lane`, partition by partition.
    #[must_use]
    pub fn records(&self, lane: &str) -> Vec<Record> {
        let inner = self.inner.lock();
        inner.lanes.get(lane).map_or_else(Vec::new, |partitions| {
            partitions
                .iter()
                .enumerate()
                .flat_map(|(partition, entries)| {
                    entries
                        .iter()
                        .enumerate()
                        .map(move |(offset, stored)| to_record(lane, partition, offset, stored))
                })
                .collect()
        })
    }

    /// Total number of records ever appended to `lane`.
    #[must_use]
    pub fn len(&self, lane: &str) -> usize {
        self.inner
            .lock()
            .lanes
            .get(lane)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    /// Names of every lane that exists.
    #[must_use]
    pub fn lanes(&self) -> Vec<String> {
        let mut lanes: Vec<_> = self.inner.lock().lanes.keys().cloned().collect();
        lanes.sort();
        lanes
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        usize::try_from(hasher.finish() % u64::from(self.partitions)).unwrap_or(0)
    }

    fn ensure_available(&self, lane: &str) -> crate::Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connection(format!(
                "memory log unavailable (lane {lane})"
            )))
        }
    }

    fn new_lane(&self) -> Vec<Vec<Stored>> {
        (0..self.partitions).map(|_| Vec::new()).collect()
    }
}

fn to_record(lane: &str, partition: usize, offset: usize, stored: &Stored) -> Record {
    Record {
        lane: lane.to_string(),
        partition: i32::try_from(partition).unwrap_or(i32::MAX),
        offset: i64::try_from(offset).unwrap_or(i64::MAX),
        key: stored.key.clone(),
        payload: stored.payload.to_vec(),
    }
}

#[async_trait]
impl LogBackend for MemoryLog {
    async fn append(&self, lane: &str, key: &str, payload: &[u8]) -> crate::Result<()> {
        self.ensure_available(lane).map_err(|e| BrokerError::Publish {
            lane: lane.to_string(),
            reason: e.to_string(),
        })?;

        let partition = self.partition_for(key);
        {
            let mut inner = self.inner.lock();
            let partitions = inner
                .lanes
                .entry(lane.to_string())
                .or_insert_with(|| self.new_lane());
            partitions[partition].push(Stored {
                key: key.to_string(),
                payload: Arc::from(payload),
            });
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        lane: &str,
        group: &str,
        start: StartFrom,
    ) -> crate::Result<Box<dyn LaneReader>> {
        self.ensure_available(lane)?;

        let positions = {
            let mut inner = self.inner.lock();
            let lengths: Vec<i64> = inner
                .lanes
                .entry(lane.to_string())
                .or_insert_with(|| self.new_lane())
                .iter()
                .map(|entries| i64::try_from(entries.len()).unwrap_or(i64::MAX))
                .collect();

            inner
                .committed
                .entry((group.to_string(), lane.to_string()))
                .or_insert_with(|| match start {
                    StartFrom::Earliest => vec![0; lengths.len()],
                    StartFrom::Latest => lengths,
                })
                .clone()
        };

        Ok(Box::new(MemoryLaneReader {
            log: self.clone(),
            lane: lane.to_string(),
            group: group.to_string(),
            positions,
            cursor: 0,
            held: HashSet::new(),
        }))
    }
}

struct MemoryLaneReader {
    log: MemoryLog,
    lane: String,
    group: String,
    positions: Vec<i64>,
    /// Partition to look at first, rotated so no partition starves
    cursor: usize,
    held: HashSet<usize>,
}

impl MemoryLaneReader {
    fn poll(&mut self) -> crate::Result<Option<Record>> {
        self.log
            .ensure_available(&self.lane)
            .map_err(|e| BrokerError::Consume {
                lane: self.lane.clone(),
                reason: e.to_string(),
            })?;

        let inner = self.log.inner.lock();
        let Some(partitions) = inner.lanes.get(&self.lane) else {
            return Ok(None);
        };

        let count = partitions.len();
        for step in 0..count {
            let partition = (self.cursor + step) % count;
            if self.held.contains(&partition) {
                continue;
            }
            let position = self.positions[partition];
            if let Some(stored) = usize::try_from(position)
                .ok()
                .and_then(|offset| partitions[partition].get(offset))
            {
                let record = to_record(
                    &self.lane,
                    partition,
                    usize::try_from(position).unwrap_or(0),
                    stored,
                );
                self.positions[partition] += 1;
                self.cursor = (partition + 1) % count;
                return Ok(Some(record));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl LaneReader for MemoryLaneReader {
    async fn next(&mut self) -> crate::Result<Record> {
        let notify = Arc::clone(&self.log.notify);
        loop {
            // Registered before polling so an append between the poll and the
            // await still wakes this reader.
            let notified = notify.notified();

            if let Some(record) = self.poll()? {
                return Ok(record);
            }

            notified.await;
        }
    }

    async fn commit(&mut self, record: &Record) -> crate::Result<()> {
        let mut inner = self.log.inner.lock();
        let committed = inner
            .committed
            .entry((self.group.clone(), self.lane.clone()))
            .or_default();
        let partition = usize::try_from(record.partition).unwrap_or(0);
        if committed.len() <= partition {
            committed.resize(partition + 1, 0);
        }
        committed[partition] = committed[partition].max(record.offset + 1);
        Ok(())
    }

    async fn hold(&mut self, record: &Record) -> crate::Result<()> {
        let partition = usize::try_from(record.partition)
            .ok()
            .filter(|partition| *partition < self.positions.len())
            .ok_or_else(|| BrokerError::Consume {
                lane: self.lane.clone(),
                reason: format!("no partition {}", record.partition),
            })?;

        self.positions[partition] = record.offset;
        self.held.insert(partition);
        Ok(())
    }

    async fn resume(&mut self, partition: i32) -> crate::Result<()> {
        if let Ok(partition) = usize::try_from(partition) {
            self.held.remove(&partition);
        }
        Ok(())
    }
}
