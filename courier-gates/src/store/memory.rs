use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::Clock;
use dashmap::DashMap;

use super::CounterStore;
use crate::StoreError;

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl Counter {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Process-local counter store
///
/// Expiry is evaluated lazily against the supplied [`Clock`] on every access.
/// The store can be switched unavailable to exercise fail-open paths.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining time to live of `key`, if it is live and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|counter| counter.is_live(now))
            .and_then(|counter| counter.expires_at)
            .and_then(|at| (at - now).to_std().ok())
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    fn deadline(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.ensure_available()?;

        let now = self.clock.now();
        Ok(self
            .counters
            .get(key)
            .filter(|counter| counter.is_live(now))
            .map(|counter| counter.value))
    }

    async fn set_ex(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_available()?;

        self.counters.insert(
            key.to_string(),
            Counter {
                value,
                expires_at: self.deadline(ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_available()?;

        let now = self.clock.now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Counter {
                value: 0,
                expires_at: None,
            };
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_available()?;

        let expires_at = self.deadline(ttl);
        if let Some(mut counter) = self.counters.get_mut(key) {
            counter.expires_at = expires_at;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use courier_common::ManualClock;
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> (ManualClock, MemoryCounterStore) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn test_incr_from_absent() {
        let (_, store) = store();
        assert_eq!(store.get("k").await.expect("get"), None);
        assert_eq!(store.incr("k").await.expect("incr"), 1);
        assert_eq!(store.incr("k").await.expect("incr"), 2);
        assert_eq!(store.get("k").await.expect("get"), Some(2));
    }

    #[tokio::test]
    async fn test_expiry_follows_clock() {
        let (clock, store) = store();
        store
            .set_ex("k", 1, Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(60)));

        clock.advance(chrono::Duration::seconds(59));
        assert_eq!(store.get("k").await.expect("get"), Some(1));

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(store.get("k").await.expect("get"), None);
        assert_eq!(store.incr("k").await.expect("incr"), 1);
        assert_eq!(store.ttl("k"), None);
    }

    #[tokio::test]
    async fn test_incr_keeps_expiry() {
        let (clock, store) = store();
        store.incr("k").await.expect("incr");
        store
            .expire("k", Duration::from_secs(10))
            .await
            .expect("expire");
        store.incr("k").await.expect("incr");

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let (_, store) = store();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.incr("k").await.is_err());
    }
}
