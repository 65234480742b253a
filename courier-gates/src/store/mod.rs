//! Counter stores backing the admission gates
//!
//! - `memory`: process-local, clock-driven expiry
//! - `redis`: shared across instances via a Redis `ConnectionManager`

mod memory;
mod redis;

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::Clock;
use serde::{Deserialize, Serialize};

pub use self::{memory::MemoryCounterStore, redis::RedisCounterStore};
use crate::StoreError;

/// A key-value store of integer counters with per-key expiry.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Current value of `key`, or `None` when it is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically add one to `key` (absent counts as zero) and return the
    /// new value. Any existing expiry is kept.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Expire `key` after `ttl`. A missing key is not an error.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum StoreConfig {
    #[default]
    Memory,
    Redis {
        /// `redis://` or `rediss://` connection URL
        url: String,
    },
}

impl StoreConfig {
    /// Connect to the configured counter store.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis connection cannot be established.
    pub async fn build(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>, StoreError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryCounterStore::new(clock))),
            Self::Redis { url } => Ok(Arc::new(RedisCounterStore::connect(url).await?)),
        }
    }
}
