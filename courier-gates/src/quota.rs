//! Daily send quota per tenant, user and provider
//!
//! The counter for a UTC day lives at
//! `email:quota:{tenant}:{user}:{provider}:{YYYY-MM-DD}` and expires at the
//! next UTC midnight. The limit is soft: checking and recording are separate
//! calls, so concurrent senders can overshoot it slightly.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use chrono::{DateTime, Days, NaiveTime, Utc};
use courier_common::{Clock, ProviderKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::CounterStore;

const fn default_limit() -> u64 {
    50
}

fn default_limits() -> AHashMap<ProviderKind, u64> {
    AHashMap::from_iter([(ProviderKind::Gmail, 100), (ProviderKind::Outlook, 100)])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Daily limit for providers without an entry in `limits`
    ///
    /// Default: 50
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Per-provider daily limits
    ///
    /// Default: gmail 100, outlook 100
    #[serde(default = "default_limits")]
    pub limits: AHashMap<ProviderKind, u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            limits: default_limits(),
        }
    }
}

impl QuotaConfig {
    #[must_use]
    pub fn limit_for(&self, provider: ProviderKind) -> u64 {
        self.limits
            .get(&provider)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

#[derive(Debug, Clone)]
pub struct QuotaGate {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
}

impl QuotaGate {
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, config: QuotaConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Counter key for today's sends.
    #[must_use]
    pub fn key(&self, user: &str, tenant: &str, provider: ProviderKind) -> String {
        let day = self.clock.now().format("%Y-%m-%d");
        format!("email:quota:{tenant}:{user}:{provider}:{day}")
    }

    /// Whether another send is allowed today.
    ///
    /// A store failure allows the send.
    pub async fn check(&self, user: &str, tenant: &str, provider: ProviderKind) -> bool {
        let key = self.key(user, tenant, provider);
        let limit = self.config.limit_for(provider);

        match self.store.get(&key).await {
            Ok(None) => true,
            Ok(Some(count)) => {
                debug!(
                    user_id = %user,
                    tenant_id = %tenant,
                    provider = %provider,
                    count,
                    limit,
                    "Checking quota"
                );
                count < limit
            }
            Err(e) => {
                error!(
                    user_id = %user,
                    tenant_id = %tenant,
                    provider = %provider,
                    error = %e,
                    "Error checking quota, allowing send"
                );
                true
            }
        }
    }

    /// Count one successful send against today's quota.
    ///
    /// Store failures are logged and swallowed.
    pub async fn record_sent(&self, user: &str, tenant: &str, provider: ProviderKind) {
        let key = self.key(user, tenant, provider);

        let recorded = async {
            let count = self.store.incr(&key).await?;
            self.store
                .expire(&key, until_midnight(self.clock.now()))
                .await?;
            Ok::<_, crate::StoreError>(count)
        }
        .await;

        match recorded {
            Ok(count) => info!(
                user_id = %user,
                tenant_id = %tenant,
                provider = %provider,
                count,
                "Recorded sent email for quota"
            ),
            Err(e) => warn!(
                user_id = %user,
                tenant_id = %tenant,
                provider = %provider,
                error = %e,
                "Error recording sent email for quota"
            ),
        }
    }
}

/// Time left until the next UTC midnight, never less than one second.
fn until_midnight(now: DateTime<Utc>) -> Duration {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .map(|tomorrow| tomorrow.and_time(NaiveTime::MIN).and_utc())
        .and_then(|midnight| (midnight - now).to_std().ok())
        .unwrap_or_default()
        .max(Duration::from_secs(1))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use courier_common::ManualClock;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::MemoryCounterStore;

    fn gate() -> (ManualClock, Arc<MemoryCounterStore>, QuotaGate) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 15, 22, 30, 0).unwrap());
        let store = Arc::new(MemoryCounterStore::new(Arc::new(clock.clone())));
        let gate = QuotaGate::new(store.clone(), Arc::new(clock.clone()), QuotaConfig::default());
        (clock, store, gate)
    }

    #[test]
    fn test_limits() {
        let config = QuotaConfig::default();
        assert_eq!(config.limit_for(ProviderKind::Gmail), 100);
        assert_eq!(config.limit_for(ProviderKind::Outlook), 100);

        let config = QuotaConfig {
            limits: AHashMap::from_iter([(ProviderKind::Gmail, 10)]),
            ..QuotaConfig::default()
        };
        assert_eq!(config.limit_for(ProviderKind::Gmail), 10);
        assert_eq!(config.limit_for(ProviderKind::Outlook), 50);
    }

    #[test]
    fn test_key_uses_utc_day() {
        let (_, _, gate) = gate();
        assert_eq!(
            gate.key("u-1", "acme", ProviderKind::Gmail),
            "email:quota:acme:u-1:gmail:2024-03-15"
        );
    }

    #[test]
    fn test_until_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 22, 30, 0).unwrap();
        assert_eq!(until_midnight(now), Duration::from_secs(90 * 60));

        let last_instant = Utc.with_ymd_and_hms(2024, 3, 15, 23, 59, 59).unwrap()
            + chrono::Duration::milliseconds(999);
        assert_eq!(until_midnight(last_instant), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_quota_exhausts_and_resets_at_midnight() {
        let (clock, store, gate) = gate();

        for _ in 0..100 {
            assert!(gate.check("u-1", "acme", ProviderKind::Gmail).await);
            gate.record_sent("u-1", "acme", ProviderKind::Gmail).await;
        }
        assert!(!gate.check("u-1", "acme", ProviderKind::Gmail).await);
        assert_eq!(
            store.ttl("email:quota:acme:u-1:gmail:2024-03-15"),
            Some(Duration::from_secs(90 * 60))
        );

        // Other providers and users are counted separately.
        assert!(gate.check("u-1", "acme", ProviderKind::Outlook).await);
        assert!(gate.check("u-2", "acme", ProviderKind::Gmail).await);

        clock.advance(chrono::Duration::minutes(90));
        assert!(gate.check("u-1", "acme", ProviderKind::Gmail).await);
    }

    #[tokio::test]
    async fn test_fails_open() {
        let (_, store, gate) = gate();
        store.set_available(false);

        assert!(gate.check("u-1", "acme", ProviderKind::Gmail).await);
        gate.record_sent("u-1", "acme", ProviderKind::Gmail).await;

        store.set_available(true);
        assert!(gate.check("u-1", "acme", ProviderKind::Gmail).await);
    }
}
