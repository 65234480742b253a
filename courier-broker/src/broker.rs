//! Delay-capable broker adapter
//!
//! # Delay lanes
//!
//! The underlying log cannot schedule. A delayed requeue therefore publishes
//! the event, stamped with `process_after`, to a lane dedicated to that exact
//! delay, and makes sure exactly one reader drains that lane back into the base
//! lane once each event is due:
//!
//! ```text
//! requeue_with_delay(base, e, 5s)
//!   ├─ e.process_after = now + 5s
//!   ├─ publish(base_delayed_5000, e)
//!   └─ ensure reader(base_delayed_5000)
//!        └─ due?  yes → strip process_after, publish(base, e), commit
//!                 no  → Republish: re-append e, commit, pause
//!                       Park:      hold e's partition until e is due
//! ```
//!
//! Every delay lane carries a single fixed delay, so within one partition
//! records come due in append order and holding a partition on its head never
//! holds back an earlier-due record of that partition. Partitions are held
//! independently: the head of one partition never waits on another's.
//!
//! Delay lanes outlive the process. [`Broker::resume_delay_lanes`] reattaches
//! readers to lanes that may still hold events from an earlier run.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_common::{Clock, DeliveryEvent, Signal, internal};
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    BrokerConfig, BrokerError, DelayConfig, DelayMode, LaneReader, LogBackend, Record, StartFrom,
    lane,
};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every event a reader pulls from its lane.
///
/// Errors are logged by the reader, which then moves on to the next record;
/// retry decisions belong to the handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: DeliveryEvent) -> Result<(), HandlerError>;
}

/// Publish / consume / requeue-with-delay over a [`LogBackend`].
#[derive(Debug)]
pub struct Broker {
    backend: Arc<dyn LogBackend>,
    clock: Arc<dyn Clock>,
    config: BrokerConfig,
    /// One reader task per delay lane
    delay_readers: DashMap<String, JoinHandle<()>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<Signal>,
    closed: AtomicBool,
}

impl Broker {
    #[must_use]
    pub fn new(backend: Arc<dyn LogBackend>, clock: Arc<dyn Clock>, config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(16);
        Self {
            backend,
            clock,
            config,
            delay_readers: DashMap::new(),
            consumers: Mutex::new(Vec::new()),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Append `event` to `lane`.
    ///
    /// Without a partition key the current epoch milliseconds are used.
    ///
    /// # Errors
    ///
    /// Serialization and backend failures are returned to the caller; nothing
    /// is dropped silently.
    pub async fn publish(
        &self,
        lane: &str,
        event: &DeliveryEvent,
        key: Option<&str>,
    ) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let payload = event.to_payload()?;
        let key = key.map_or_else(|| self.clock.now_millis().to_string(), str::to_string);

        self.backend
            .append(lane, &key, &payload)
            .await
            .inspect_err(|e| {
                error!(lane = %lane, event_id = %event.id, error = %e, "Failed to publish event");
            })?;

        debug!(lane = %lane, event_id = %event.id, "Event published");
        Ok(())
    }

    /// Start a durable reader for `group` on `lane` delivering to `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader cannot be registered. Failures after that
    /// point are logged and the reader keeps running.
    pub async fn consume(
        &self,
        lane: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let reader = self
            .backend
            .subscribe(lane, group, self.config.start_from)
            .await
            .inspect_err(|e| {
                error!(lane = %lane, group = %group, error = %e, "Failed to start consumer");
            })?;

        let task = ConsumerTask {
            lane: lane.to_string(),
            group: group.to_string(),
            handler,
            backoff: self.config.reader_backoff(),
            shutdown: self.shutdown.subscribe(),
        };
        self.consumers.lock().push(tokio::spawn(task.run(reader)));

        info!(lane = %lane, group = %group, "Consumer started");
        Ok(())
    }

    /// Publish `event` to `base` once `delay` has elapsed.
    ///
    /// A zero delay is a plain publish. Otherwise the event is stamped with
    /// `process_after` and parked on the delay lane for `(base, delay)`, whose
    /// single reader is started on first use.
    ///
    /// # Errors
    ///
    /// Publish failures are returned to the caller.
    pub async fn requeue_with_delay(
        &self,
        base: &str,
        event: &DeliveryEvent,
        key: Option<&str>,
        delay: Duration,
    ) -> crate::Result<()> {
        if delay.is_zero() {
            return self.publish(base, event, key).await;
        }

        let delay_millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let mut delayed = event.clone();
        delayed.process_after = Some(self.clock.now_millis().saturating_add(delay_millis));

        let delay_lane = lane::delay_lane(base, delay);
        self.publish(&delay_lane, &delayed, key).await?;
        self.ensure_delay_reader(&delay_lane, base);

        Ok(())
    }

    /// Start the reader for `delay_lane` unless one already exists.
    ///
    /// Returns `true` if this call started it.
    pub fn ensure_delay_reader(&self, delay_lane: &str, base: &str) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        match self.delay_readers.entry(delay_lane.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let task = DelayTask {
                    backend: Arc::clone(&self.backend),
                    clock: Arc::clone(&self.clock),
                    delay_lane: delay_lane.to_string(),
                    base: base.to_string(),
                    group: lane::delay_group(delay_lane),
                    delay: self.config.delay.clone(),
                    backoff: self.config.reader_backoff(),
                    shutdown: self.shutdown.subscribe(),
                    held: HashMap::new(),
                };
                slot.insert(tokio::spawn(task.run()));

                internal!(
                    level = INFO,
                    "Delay reader started for {delay_lane} -> {base}"
                );
                true
            }
        }
    }

    /// Start readers for the delay lanes of `base` for each of `delays`.
    ///
    /// Zero delays have no lane and are skipped. Returns how many readers
    /// this call started.
    pub fn resume_delay_lanes(&self, base: &str, delays: impl IntoIterator<Item = Duration>) -> usize {
        delays
            .into_iter()
            .filter(|delay| !delay.is_zero())
            .map(|delay| lane::delay_lane(base, delay))
            .filter(|delay_lane| self.ensure_delay_reader(delay_lane, base))
            .count()
    }

    /// Number of delay lanes with a running reader.
    pub fn delay_reader_count(&self) -> usize {
        self.delay_readers.len()
    }

    pub fn has_delay_reader(&self, delay_lane: &str) -> bool {
        self.delay_readers.contains_key(delay_lane)
    }

    /// Stop every reader and wait for them to finish.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        internal!(level = INFO, "Broker shutting down");
        let _ = self.shutdown.send(Signal::Shutdown);

        let consumers = std::mem::take(&mut *self.consumers.lock());
        let lanes: Vec<String> = self
            .delay_readers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let delay_readers = lanes
            .iter()
            .filter_map(|lane| self.delay_readers.remove(lane).map(|(_, handle)| handle));

        for handle in consumers.into_iter().chain(delay_readers.collect::<Vec<_>>()) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reader task ended abnormally");
            }
        }

        internal!(level = INFO, "Broker shutdown complete");
    }
}

/// Sleep for `duration` unless shutdown arrives first.
///
/// Returns `false` when shutdown was signalled.
async fn pause(shutdown: &mut broadcast::Receiver<Signal>, duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        _ = shutdown.recv() => false,
    }
}

/// Wait for the next record, or `None` on shutdown.
async fn next_record(
    reader: &mut dyn LaneReader,
    shutdown: &mut broadcast::Receiver<Signal>,
) -> Option<crate::Result<Record>> {
    tokio::select! {
        biased;
        _ = shutdown.recv() => None,
        record = reader.next() => Some(record),
    }
}

struct ConsumerTask {
    lane: String,
    group: String,
    handler: Arc<dyn EventHandler>,
    backoff: Duration,
    shutdown: broadcast::Receiver<Signal>,
}

impl ConsumerTask {
    async fn run(mut self, mut reader: Box<dyn LaneReader>) {
        while let Some(next) = next_record(reader.as_mut(), &mut self.shutdown).await {
            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    error!(lane = %self.lane, group = %self.group, error = %e, "Error reading from lane");
                    if pause(&mut self.shutdown, self.backoff).await {
                        continue;
                    }
                    break;
                }
            };

            debug!(
                lane = %self.lane,
                partition = record.partition,
                offset = record.offset,
                "Received record"
            );

            match DeliveryEvent::from_payload(&record.payload) {
                Ok(event) => {
                    let event_id = event.id.clone();
                    if let Err(e) = self.handler.handle(event).await {
                        error!(
                            lane = %self.lane,
                            partition = record.partition,
                            offset = record.offset,
                            event_id = %event_id,
                            error = %e,
                            "Error processing record"
                        );
                    }
                }
                Err(e) => {
                    error!(
                        lane = %self.lane,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Skipping undecodable record"
                    );
                }
            }

            if let Err(e) = reader.commit(&record).await {
                warn!(lane = %self.lane, error = %e, "Failed to commit position");
            }
        }

        internal!("Consumer for {} stopped", self.lane);
    }
}

struct DelayTask {
    backend: Arc<dyn LogBackend>,
    clock: Arc<dyn Clock>,
    delay_lane: String,
    base: String,
    group: String,
    delay: DelayConfig,
    backoff: Duration,
    shutdown: broadcast::Receiver<Signal>,
    /// Due time (epoch millis) of the record each held partition waits on
    held: HashMap<i32, i64>,
}

/// What woke a delay reader.
enum Wake {
    Record(crate::Result<Record>),
    /// A held partition may have become due.
    Tick,
    Shutdown,
}

/// How a delayed record was settled.
enum Settled {
    /// Forwarded, re-appended or undecodable: commit it.
    Done,
    /// Its partition is held until the record is due; nothing to commit.
    Held,
    /// Shutdown arrived first; leave it uncommitted.
    Interrupted,
}

impl DelayTask {
    async fn run(mut self) {
        let Some(mut reader) = self.subscribe().await else {
            return;
        };

        loop {
            self.release_due(reader.as_mut()).await;

            let record = match self.wake(reader.as_mut()).await {
                Wake::Shutdown => break,
                Wake::Tick => continue,
                Wake::Record(Ok(record)) => record,
                Wake::Record(Err(e)) => {
                    error!(lane = %self.delay_lane, error = %e, "Error reading delay lane");
                    if pause(&mut self.shutdown, self.backoff).await {
                        continue;
                    }
                    break;
                }
            };

            let settled = match DeliveryEvent::from_payload(&record.payload) {
                Ok(event) => self.handle(reader.as_mut(), &record, event).await,
                Err(e) => {
                    error!(
                        lane = %self.delay_lane,
                        offset = record.offset,
                        error = %e,
                        "Skipping undecodable delayed record"
                    );
                    Settled::Done
                }
            };

            match settled {
                Settled::Done => {
                    if let Err(e) = reader.commit(&record).await {
                        warn!(lane = %self.delay_lane, error = %e, "Failed to commit delay position");
                    }
                }
                Settled::Held => {}
                Settled::Interrupted => break,
            }
        }

        internal!("Delay reader for {} stopped", self.delay_lane);
    }

    async fn subscribe(&mut self) -> Option<Box<dyn LaneReader>> {
        loop {
            match self
                .backend
                .subscribe(&self.delay_lane, &self.group, StartFrom::Earliest)
                .await
            {
                Ok(reader) => return Some(reader),
                Err(e) => {
                    error!(
                        lane = %self.delay_lane,
                        base = %self.base,
                        error = %e,
                        "Failed to start delay reader, retrying"
                    );
                    if !pause(&mut self.shutdown, self.backoff).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Wait for the next record, waking early when a held partition comes due.
    async fn wake(&mut self, reader: &mut dyn LaneReader) -> Wake {
        let poll_interval = self.delay.poll_interval();
        let now = self.clock.now_millis();
        let tick = self
            .held
            .values()
            .min()
            .map(|due| Duration::from_millis(u64::try_from(due - now).unwrap_or(0)).min(poll_interval));

        tokio::select! {
            biased;
            _ = self.shutdown.recv() => Wake::Shutdown,
            record = reader.next() => Wake::Record(record),
            () = tokio::time::sleep(tick.unwrap_or(poll_interval)), if tick.is_some() => Wake::Tick,
        }
    }

    /// Resume every held partition whose record is now due.
    async fn release_due(&mut self, reader: &mut dyn LaneReader) {
        let now = self.clock.now_millis();
        let due: Vec<i32> = self
            .held
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(partition, _)| *partition)
            .collect();

        for partition in due {
            match reader.resume(partition).await {
                Ok(()) => {
                    self.held.remove(&partition);
                }
                Err(e) => {
                    warn!(lane = %self.delay_lane, partition, error = %e, "Failed to resume held partition");
                }
            }
        }
    }

    async fn handle(
        &mut self,
        reader: &mut dyn LaneReader,
        record: &Record,
        mut event: DeliveryEvent,
    ) -> Settled {
        if let Some(due) = event.process_after
            && !event.is_due(self.clock.now_millis())
        {
            return self.defer(reader, record, due).await;
        }

        event.process_after = None;
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to re-encode delayed event");
                return Settled::Done;
            }
        };

        if !self
            .append_until_accepted(&self.base.clone(), &record.key, &payload)
            .await
        {
            return Settled::Interrupted;
        }

        debug!(
            event_id = %event.id,
            from = %self.delay_lane,
            to = %self.base,
            "Delayed event forwarded"
        );
        Settled::Done
    }

    /// Put a record that is not yet due back for later.
    ///
    /// `Park` holds its partition; `Republish` (and a failed hold) appends a
    /// copy to the delay lane so the original can be committed.
    async fn defer(&mut self, reader: &mut dyn LaneReader, record: &Record, due: i64) -> Settled {
        if self.delay.mode == DelayMode::Park {
            match reader.hold(record).await {
                Ok(()) => {
                    self.held.insert(record.partition, due);
                    return Settled::Held;
                }
                Err(e) => {
                    warn!(lane = %self.delay_lane, error = %e, "Failed to hold partition, re-appending instead");
                }
            }
        }

        if !self
            .append_until_accepted(&self.delay_lane.clone(), &record.key, &record.payload)
            .await
        {
            return Settled::Interrupted;
        }

        // The copy now carries the event; pause before the next read.
        if pause(&mut self.shutdown, self.delay.poll_interval()).await {
            Settled::Done
        } else {
            Settled::Interrupted
        }
    }

    /// Keep appending until the log accepts the record.
    ///
    /// Returns `false` only if shutdown arrives first.
    async fn append_until_accepted(&mut self, lane: &str, key: &str, payload: &[u8]) -> bool {
        loop {
            match self.backend.append(lane, key, payload).await {
                Ok(()) => return true,
                Err(e) => {
                    error!(lane = %lane, from = %self.delay_lane, error = %e, "Failed to append delayed record, retrying");
                    if !pause(&mut self.shutdown, self.delay.poll_interval()).await {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use courier_common::{DeliveryRequest, ManualClock, SystemClock};

    use super::*;
    use crate::MemoryLog;

    fn event() -> DeliveryEvent {
        DeliveryEvent::from_request(
            DeliveryRequest {
                id: Some("evt-1".to_string()),
                tenant_id: "acme".to_string(),
                user_id: "u-1".to_string(),
                to_address: "user@example.com".to_string(),
                subject: "s".to_string(),
                body: "b".to_string(),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    fn broker(log: &MemoryLog, clock: Arc<dyn Clock>, mode: DelayMode) -> Broker {
        let mut config = BrokerConfig::default();
        config.delay.mode = mode;
        config.delay.poll_interval_ms = 10;
        config.reader_backoff_ms = 10;
        Broker::new(Arc::new(log.clone()), clock, config)
    }

    #[tokio::test]
    async fn test_zero_delay_publishes_directly() {
        let log = MemoryLog::new(1);
        let broker = broker(&log, Arc::new(SystemClock), DelayMode::Park);

        broker
            .requeue_with_delay("main", &event(), Some("evt-1"), Duration::ZERO)
            .await
            .expect("requeue");

        assert_eq!(log.len("main"), 1);
        assert_eq!(broker.delay_reader_count(), 0);
        let stored = DeliveryEvent::from_payload(&log.records("main")[0].payload).expect("decode");
        assert_eq!(stored.process_after, None);
    }

    #[tokio::test]
    async fn test_delay_stamps_process_after() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let log = MemoryLog::new(1);
        let broker = broker(&log, Arc::new(clock), DelayMode::Park);

        broker
            .requeue_with_delay("main", &event(), Some("evt-1"), Duration::from_secs(25))
            .await
            .expect("requeue");

        let records = log.records("main_delayed_25000");
        assert_eq!(records.len(), 1);
        let stored = DeliveryEvent::from_payload(&records[0].payload).expect("decode");
        assert_eq!(stored.process_after, Some(start.timestamp_millis() + 25_000));
        assert!(broker.has_delay_reader("main_delayed_25000"));

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let log = MemoryLog::new(1);
        let broker = broker(&log, Arc::new(SystemClock), DelayMode::Park);
        broker.shutdown().await;

        let result = broker.publish("main", &event(), None).await;
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(!broker.ensure_delay_reader("main_delayed_5000", "main"));
    }

    #[tokio::test]
    async fn test_publish_without_key_uses_clock() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let log = MemoryLog::new(1);
        let broker = broker(&log, Arc::new(ManualClock::new(start)), DelayMode::Park);

        broker.publish("main", &event(), None).await.expect("publish");
        assert_eq!(log.records("main")[0].key, start.timestamp_millis().to_string());
    }
}
