//! Lane naming.
//!
//! A delay lane exists per `(base lane, delay)` pair. The same pair always maps
//! to the same name so lanes are reused and their number stays bounded by the
//! set of distinct delays in use.

use std::time::Duration;

/// Name of the lane holding events bound for `base` after `delay`.
#[must_use]
pub fn delay_lane(base: &str, delay: Duration) -> String {
    format!("{base}_delayed_{}", delay.as_millis())
}

/// Consumer group of the single reader attached to a delay lane.
#[must_use]
pub fn delay_group(delay_lane: &str) -> String {
    format!("delayed-processor-{delay_lane}")
}
