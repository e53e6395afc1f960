use chrono::Utc;
use serde_json::Value;
use std::slice;
use tracing::{instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::error::QueueError;
use crate::job::Job;
use crate::lifecycle::{self, Resolution};
use crate::registry::JobType;
use crate::store::JobStore;

/// A job this worker has claimed. Consumed by resolving it.
#[derive(Debug)]
pub struct JobHandle<S> {
    job: Job,
    job_type: JobType,
    backoff: BackoffPolicy,
    store: S,
}

impl<S: JobStore> JobHandle<S> {
    pub(crate) fn new(job: Job, job_type: JobType, backoff: BackoffPolicy, store: S) -> Self {
        Self {
            job,
            job_type,
            backoff,
            store,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn data(&self) -> &Value {
        &self.job.data
    }

    /// Attempts made so far, this one included.
    pub fn run_count(&self) -> u32 {
        self.job.run_count
    }

    /// Runs the type's handler and records the outcome.
    #[instrument(
        skip_all,
        err,
        fields(jid = %self.job.id, job_type = %self.job.job_type, run_count = self.job.run_count)
    )]
    pub async fn execute(self) -> Result<Resolution, QueueError> {
        let handler = self.job_type.handler().clone();
        match handler.execute(self.job.clone()).await {
            Ok(result) => self.complete(result).await,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "Job handler failed");
                self.fail(message).await
            }
        }
    }

    pub async fn complete(mut self, result: Value) -> Result<Resolution, QueueError> {
        let resolution = lifecycle::succeed(&mut self.job, result, Utc::now());
        self.store.update(slice::from_ref(&self.job)).await?;
        Ok(resolution)
    }

    /// Schedules a retry, or gives up once the type's `max_retry` is used up.
    pub async fn fail(mut self, error: impl Into<String>) -> Result<Resolution, QueueError> {
        let resolution = lifecycle::fail(
            &mut self.job,
            error.into(),
            self.job_type.retry_limit(),
            &self.backoff,
            Utc::now(),
        );
        self.store.update(slice::from_ref(&self.job)).await?;
        if resolution == Resolution::Dead {
            warn!(jid = %self.job.id, run_count = self.job.run_count, "Job failed permanently");
        }
        Ok(resolution)
    }
}
