//! Tumbling-window request limiter
//!
//! Counters are keyed `ratelimit:{user}:{tenant}:{endpoint}:{bucket}` where
//! `bucket = floor(now_secs / window_secs)`. A caller can therefore get up to
//! twice the limit through across a bucket boundary.

use std::{sync::Arc, time::Duration};

use courier_common::Clock;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::{CounterStore, StoreError};

const fn default_limit() -> u64 {
    60
}

const fn default_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    ///
    /// Default: 60
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length (in seconds)
    ///
    /// Default: 60
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counter key for the bucket `now` falls in.
    #[must_use]
    pub fn key(&self, user: &str, tenant: &str, endpoint: &str, window_secs: u64) -> String {
        let now = u64::try_from(self.clock.now().timestamp()).unwrap_or(0);
        let bucket = now / window_secs.max(1);
        format!("ratelimit:{user}:{tenant}:{endpoint}:{bucket}")
    }

    /// Count one request against `key` and report whether it is over `limit`.
    ///
    /// A request that is over the limit is not counted. A store failure
    /// reports "not limited".
    pub async fn is_limited(&self, key: &str, limit: u64, window_secs: u64) -> bool {
        match self.count(key, limit, window_secs).await {
            Ok(None) => false,
            Ok(Some(count)) => {
                warn!(key = %key, count, limit, "Rate limit exceeded");
                true
            }
            Err(e) => {
                error!(key = %key, error = %e, "Error checking rate limit, allowing request");
                false
            }
        }
    }

    /// Returns the current count when `key` is already at `limit`.
    async fn count(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<Option<u64>, StoreError> {
        match self.store.get(key).await? {
            None => {
                self.store
                    .set_ex(key, 1, Duration::from_secs(window_secs))
                    .await?;
                Ok(None)
            }
            Some(count) if count >= limit => Ok(Some(count)),
            Some(_) => {
                self.store.incr(key).await?;
                Ok(None)
            }
        }
    }

    /// [`Self::is_limited`] with the configured limit and window.
    pub async fn check(&self, user: &str, tenant: &str, endpoint: &str) -> bool {
        let RateLimitConfig { limit, window_secs } = self.config;
        let key = self.key(user, tenant, endpoint, window_secs);
        self.is_limited(&key, limit, window_secs).await
    }
}
