//! Delivery policies kept apart from the orchestration loop.
//!
//! - [`RetryPolicy`]: attempt budget, backoff schedule and the fixed delays for
//!   throttled and transient failures

pub mod retry;

pub use retry::RetryPolicy;
