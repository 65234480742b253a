//! Retry policy for delivery attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Jittered delays snap to this many steps either side of the exact delay, so
/// one retry count maps to at most `2 * JITTER_STEPS + 1` delay lanes.
const JITTER_STEPS: i64 = 4;

/// How failed attempts are rescheduled.
///
/// Only provider send failures count against `max_retries`; throttled and
/// transient failures are retried on their own fixed delays without using up
/// an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed sends allowed before the event is dead-lettered.
    ///
    /// Default: 5
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff: attempt `n` waits `base^n` seconds.
    ///
    /// Default: 5 (5s, 25s, 125s, 625s, 3125s)
    #[serde(default = "defaults::backoff_base")]
    pub backoff_base: u64,

    /// Delay after the daily quota is exhausted (in seconds).
    ///
    /// Default: 3600
    #[serde(default = "defaults::throttle_delay_secs")]
    pub throttle_delay_secs: u64,

    /// Delay after an infrastructure failure (in seconds).
    ///
    /// Default: 60
    #[serde(default = "defaults::transient_delay_secs")]
    pub transient_delay_secs: u64,

    /// Randomise backoff delays within ±`jitter_factor`.
    ///
    /// Each jittered delay gets its own delay lane, so the jitter is quantised
    /// to a few fixed steps rather than spread continuously.
    ///
    /// Default: 0.0, which keeps the schedule exact
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            backoff_base: defaults::backoff_base(),
            throttle_delay_secs: defaults::throttle_delay_secs(),
            transient_delay_secs: defaults::transient_delay_secs(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Whether an event that has failed `retry_count` sends goes back to the
    /// main lane (`true`) or to the dead-letter lane (`false`).
    #[must_use]
    pub const fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    #[must_use]
    pub const fn remaining_attempts(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }

    /// Backoff before the attempt that follows failure number `retry_count`.
    #[must_use]
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let secs = self.backoff_base.saturating_pow(retry_count);

        if self.jitter_factor <= 0.0 {
            return Duration::from_secs(secs);
        }

        let step = rand::rng().random_range(-JITTER_STEPS..=JITTER_STEPS);
        self.jittered(secs, step)
    }

    /// `secs` moved `step` jitter steps away from itself.
    fn jittered(&self, secs: u64, step: i64) -> Duration {
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let range = (secs as f64) * self.jitter_factor.clamp(0.0, 1.0);
            let offset = range * (step as f64) / (JITTER_STEPS as f64);
            ((secs as f64) + offset).max(0.0) as u64
        };

        Duration::from_secs(jittered)
    }

    /// Every delay an event can be requeued to the main lane with: each
    /// backoff (with its jitter steps), the throttle delay and the transient
    /// delay. Sorted, without duplicates.
    #[must_use]
    pub fn main_lane_delays(&self) -> Vec<Duration> {
        let steps = if self.jitter_factor > 0.0 {
            -JITTER_STEPS..=JITTER_STEPS
        } else {
            0..=0
        };

        let mut delays: Vec<Duration> = (1..self.max_retries)
            .flat_map(|retry_count| {
                let secs = self.backoff_base.saturating_pow(retry_count);
                steps.clone().map(move |step| self.jittered(secs, step))
            })
            .chain([self.throttle_delay(), self.transient_delay()])
            .collect();
        delays.sort_unstable();
        delays.dedup();
        delays
    }

    #[must_use]
    pub const fn throttle_delay(&self) -> Duration {
        Duration::from_secs(self.throttle_delay_secs)
    }

    #[must_use]
    pub const fn transient_delay(&self) -> Duration {
        Duration::from_secs(self.transient_delay_secs)
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        5
    }

    pub const fn backoff_base() -> u64 {
        5
    }

    pub const fn throttle_delay_secs() -> u64 {
        3600
    }

    pub const fn transient_delay_secs() -> u64 {
        60
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.throttle_delay(), Duration::from_secs(3600));
        assert_eq!(policy.transient_delay(), Duration::from_secs(60));
        assert!(policy.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let schedule: Vec<u64> = (1..=5).map(|n| policy.backoff_delay(n).as_secs()).collect();
        assert_eq!(schedule, vec![5, 25, 125, 625, 3125]);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
        assert_eq!(policy.remaining_attempts(3), 2);
        assert_eq!(policy.remaining_attempts(7), 0);
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy {
            backoff_base: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_main_lane_delays() {
        let secs: Vec<u64> = RetryPolicy::default()
            .main_lane_delays()
            .iter()
            .map(Duration::as_secs)
            .collect();
        assert_eq!(secs, vec![5, 25, 60, 125, 625, 3600]);
    }

    #[test]
    fn test_jitter_is_quantised() {
        let policy = RetryPolicy {
            jitter_factor: 0.2,
            ..RetryPolicy::default()
        };

        let mut seen: Vec<u64> = (0..500).map(|_| policy.backoff_delay(2).as_secs()).collect();
        seen.sort_unstable();
        seen.dedup();

        let allowed = [20, 21, 22, 23, 25, 26, 27, 28, 30];
        assert!(seen.iter().all(|secs| allowed.contains(secs)), "{seen:?}");
        assert!(seen.len() <= allowed.len());

        let lanes: Vec<u64> = policy.main_lane_delays().iter().map(Duration::as_secs).collect();
        for secs in allowed {
            assert!(lanes.contains(&secs), "{secs} has no lane");
        }
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.2,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let secs = policy.backoff_delay(2).as_secs();
            assert!((20..=30).contains(&secs), "{secs} outside 25 ±20%");
        }
    }
}
