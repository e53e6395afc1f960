//! Configuration for a queue instance: storage location, backlog sizing and timing.
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::QueueError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// MongoDB connection string. The database named in the URI is used, `qq` otherwise.
    ///
    /// A standalone server handles single-job writes. Submitting batches of two or more jobs
    /// needs a replica set (for example `mongodb://localhost:27017/qq?replicaSet=rs0`).
    pub database_url: String,
    /// CA file for TLS connections to the database.
    pub database_cert_file: Option<String>,
    /// Floor for the per-type backlog capacity.
    pub min_backlog_capacity: usize,
    /// Fraction of capacity below which the backlog is topped up.
    pub backlog_low_water: f64,
    /// Minimum spacing between two low-water refills of the same backlog.
    #[serde(with = "crate::backoff::millis")]
    pub refill_interval: Duration,
    /// How long workers wait after draining an empty backlog.
    pub idle_backoff: BackoffPolicy,
    /// Retry delay for job types that don't bring their own.
    pub retry_backoff: BackoffPolicy,
    /// Buffer size of the notification channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "mongodb://localhost:27017/qq".to_string(),
            database_cert_file: None,
            min_backlog_capacity: 100,
            backlog_low_water: 0.25,
            refill_interval: Duration::from_secs(1),
            idle_backoff: BackoffPolicy::new(Duration::from_millis(50), 2.0, Duration::from_secs(5)),
            retry_backoff: BackoffPolicy::default(),
            event_capacity: 1024,
        }
    }
}

impl QueueConfig {
    /// Creates a `QueueConfig` from environment variables.
    ///
    /// # Defaults
    ///
    /// - `QQ_DATABASE_URL` defaults to `"mongodb://localhost:27017/qq"`. Point it at a replica
    ///   set to submit batches of more than one job.
    /// - `QQ_DATABASE_CERT_FILE` is unset by default.
    /// - `QQ_MIN_BACKLOG_CAPACITY` defaults to `100`.
    /// - `QQ_BACKLOG_LOW_WATER` defaults to `0.25`.
    /// - `QQ_REFILL_INTERVAL_MS` defaults to `1000`.
    /// - `QQ_EVENT_CAPACITY` defaults to `1024`.
    ///
    /// Values that fail to parse fall back to their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env::var("QQ_DATABASE_URL").unwrap_or(defaults.database_url),
            database_cert_file: env::var("QQ_DATABASE_CERT_FILE").ok(),
            min_backlog_capacity: parse_var("QQ_MIN_BACKLOG_CAPACITY")
                .unwrap_or(defaults.min_backlog_capacity),
            backlog_low_water: parse_var("QQ_BACKLOG_LOW_WATER")
                .unwrap_or(defaults.backlog_low_water),
            refill_interval: parse_var("QQ_REFILL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.refill_interval),
            event_capacity: parse_var("QQ_EVENT_CAPACITY").unwrap_or(defaults.event_capacity),
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if !(self.backlog_low_water > 0.0 && self.backlog_low_water <= 1.0) {
            return Err(QueueError::Config(format!(
                "backlog_low_water must be in (0, 1], got {}",
                self.backlog_low_water
            )));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Backlog capacity for a type with the given concurrency limit.
    pub fn backlog_capacity(&self, concurrency_limit: Option<usize>) -> usize {
        let wanted = concurrency_limit.unwrap_or(1).saturating_mul(2);
        wanted.max(self.min_backlog_capacity).max(1)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
