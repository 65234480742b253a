//! Admission gates
//!
//! Both gates are thin policies over a [`CounterStore`]: a shared key-value
//! store with atomic increments and expiry.
//!
//! - [`QuotaGate`]: per-tenant, per-user, per-provider daily send quota
//! - [`RateLimiter`]: tumbling-window request counter per endpoint
//!
//! Store failures never block traffic; both gates fail open.

mod error;
mod quota;
mod rate_limit;
pub mod store;

pub use error::StoreError;
pub use quota::{QuotaConfig, QuotaGate};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use store::{CounterStore, MemoryCounterStore, RedisCounterStore, StoreConfig};
