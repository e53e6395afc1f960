//! Claim and retry transitions of a single job.
//!
//! `pending -> claimed -> succeeded | pending (retry) | failed`. These functions only touch
//! the in-memory record; persisting the outcome is up to the caller. A claim is only valid
//! against the stored record, which is why storage backends apply [`claim`] atomically.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backoff::BackoffPolicy;
use crate::job::{Job, JobState};

/// What happened to a job after its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    /// Back to pending, eligible again at `at`.
    Retry { at: DateTime<Utc> },
    /// Retries exhausted; terminal.
    Dead,
}

/// Marks the job as claimed if `expected_run_count` still matches.
///
/// Returns `false` and leaves the job untouched when the precondition fails.
pub fn claim(job: &mut Job, expected_run_count: u32, now: DateTime<Utc>) -> bool {
    if job.state() != JobState::Pending || job.run_count != expected_run_count {
        return false;
    }
    job.run_count += 1;
    job.actual_run_time = Some(now);
    true
}

pub fn succeed(job: &mut Job, result: Value, now: DateTime<Utc>) -> Resolution {
    job.end_time = Some(now);
    job.result = Some(result);
    job.error = None;
    Resolution::Succeeded
}

/// Records a handler failure and decides between retry and giving up.
///
/// `run_count` already includes the failed attempt, so a type with `max_retry = N` gets
/// `N + 1` attempts in total. The error is kept on the job either way; a job waiting for a
/// retry shows why its last attempt failed.
pub fn fail(
    job: &mut Job,
    error: String,
    max_retry: u32,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) -> Resolution {
    job.error = Some(error);
    job.result = None;

    let retries_used = job.run_count.saturating_sub(1);
    if retries_used < max_retry {
        let at = now
            .checked_add_signed(backoff.chrono_delay(retries_used))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        job.desired_run_time = at;
        job.actual_run_time = None;
        job.end_time = None;
        Resolution::Retry { at }
    } else {
        job.end_time = Some(now);
        Resolution::Dead
    }
}
