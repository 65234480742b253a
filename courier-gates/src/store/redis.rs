use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use tracing::info;

use super::CounterStore;
use crate::StoreError;

/// Redis-backed counters shared by every courier instance
///
/// `ConnectionManager` reconnects on its own; a clone per command shares the
/// underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis counter store");
        Ok(Self { connection })
    }

    #[must_use]
    pub const fn from_manager(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

fn seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        value
            .map(|raw| {
                raw.parse().map_err(|_| StoreError::NotACounter {
                    key: key.to_string(),
                })
            })
            .transpose()
    }

    async fn set_ex(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let () = connection.set_ex(key, value, seconds(ttl)).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        Ok(connection.incr(key, 1_u64).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: bool = connection
            .expire(key, i64::try_from(seconds(ttl)).unwrap_or(i64::MAX))
            .await?;
        Ok(())
    }
}
