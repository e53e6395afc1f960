use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Where a job is in its life, derived from its stored fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in storage, either due or scheduled for later (including retries).
    Pending,
    /// Held by a worker.
    Claimed,
    Succeeded,
    /// Retries exhausted.
    Failed,
}

/// One unit of work as persisted in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub data: Value,
    pub title: String,
    pub priority: i32,
    pub queue_time: DateTime<Utc>,
    pub desired_run_time: DateTime<Utc>,
    pub actual_run_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_count: u32,
    /// Error of the most recent failed attempt. Set on a job waiting for a retry as well as
    /// on one that failed for good; cleared when an attempt succeeds.
    pub error: Option<String>,
    /// Handler output, set only once the job succeeded.
    pub result: Option<Value>,
}

impl Job {
    pub fn state(&self) -> JobState {
        match (self.end_time, self.actual_run_time) {
            (Some(_), _) if self.error.is_some() => JobState::Failed,
            (Some(_), _) => JobState::Succeeded,
            (None, Some(_)) => JobState::Claimed,
            (None, None) => JobState::Pending,
        }
    }

    /// Pending, due by `now`, and still within `max_retry`.
    pub fn is_eligible(&self, max_retry: u32, now: DateTime<Utc>) -> bool {
        self.state() == JobState::Pending
            && self.run_count <= max_retry
            && self.desired_run_time <= now
    }
}

/// A job submission. Only the type is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    #[serde(default)]
    pub data: Value,
    pub title: Option<String>,
    pub priority: Option<i32>,
    pub desired_run_time: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, desired_run_time: DateTime<Utc>) -> Self {
        self.desired_run_time = Some(desired_run_time);
        self
    }

    /// Fills in defaults and assigns a fresh id.
    pub fn build(self, now: DateTime<Utc>) -> Job {
        let title = self
            .title
            .unwrap_or_else(|| format!("{} untitled", self.job_type));
        Job {
            id: Uuid::new_v4().to_string(),
            title,
            job_type: self.job_type,
            data: self.data,
            priority: self.priority.unwrap_or(0),
            queue_time: now,
            desired_run_time: self.desired_run_time.unwrap_or(now),
            actual_run_time: None,
            end_time: None,
            run_count: 0,
            error: None,
            result: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn build_fills_defaults() {
        let now = Utc::now();
        let job = NewJob::new("email").data(json!({"to": "a@b.c"})).build(now);
        assert_eq!(job.title, "email untitled");
        assert_eq!(job.priority, 0);
        assert_eq!(job.desired_run_time, now);
        assert_eq!(job.queue_time, now);
        assert_eq!(job.run_count, 0);
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn build_keeps_explicit_fields() {
        let now = Utc::now();
        let later = now + Duration::minutes(5);
        let job = NewJob::new("email")
            .title("welcome")
            .priority(3)
            .run_at(later)
            .build(now);
        assert_eq!(job.title, "welcome");
        assert_eq!(job.priority, 3);
        assert_eq!(job.desired_run_time, later);
        assert!(!job.is_eligible(0, now));
        assert!(job.is_eligible(0, later));
    }

    #[test]
    fn ids_are_unique() {
        let now = Utc::now();
        let a = NewJob::new("t").build(now);
        let b = NewJob::new("t").build(now);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn state_follows_fields() {
        let now = Utc::now();
        let mut job = NewJob::new("t").build(now);
        job.actual_run_time = Some(now);
        assert_eq!(job.state(), JobState::Claimed);
        job.end_time = Some(now);
        job.error = Some("boom".into());
        assert_eq!(job.state(), JobState::Failed);
        job.error = None;
        job.result = Some(json!(1));
        assert_eq!(job.state(), JobState::Succeeded);
    }
}
