//! Exponential backoff used for job retries and for idle workers.

use serde::Deserialize;
use std::time::Duration;

/// Upper bound on how far a retry is pushed into the future: 100 years.
pub const MAX_SCHEDULE_DELAY_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(with = "millis")]
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// No delay at all. Retries become eligible as soon as they are persisted.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Delay for the given zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let backoff = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = backoff.min(self.max.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Same as [`BackoffPolicy::delay`], as a chrono duration for timestamp arithmetic.
    ///
    /// Never longer than [`MAX_SCHEDULE_DELAY_MS`].
    pub fn chrono_delay(&self, attempt: u32) -> chrono::Duration {
        let millis = i64::try_from(self.delay(attempt).as_millis()).unwrap_or(i64::MAX);
        chrono::Duration::milliseconds(millis.min(MAX_SCHEDULE_DELAY_MS))
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn caps_at_max() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(5));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn immediate_never_waits() {
        let policy = BackoffPolicy::immediate();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.chrono_delay(7), chrono::Duration::zero());
    }

    #[test]
    fn huge_max_stays_a_positive_schedule_delay() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::MAX);
        let delay = policy.chrono_delay(u32::MAX);
        assert!(delay > chrono::Duration::zero());
        assert_eq!(delay, chrono::Duration::milliseconds(MAX_SCHEDULE_DELAY_MS));
        assert!(chrono::Utc::now().checked_add_signed(delay).is_some());
    }

    #[test]
    fn deserializes_from_millis() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"initial": 250, "multiplier": 1.5, "max": 1000}"#).unwrap();
        assert_eq!(policy.initial, Duration::from_millis(250));
        assert_eq!(policy.max, Duration::from_secs(1));
    }
}
