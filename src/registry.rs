use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::backoff::BackoffPolicy;
use crate::error::QueueError;
use crate::job::Job;

/// Business logic behind a job type.
///
/// Called once per claim. An `Err` feeds the retry machinery and is stored on the job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn execute(&self, job: Job) -> Result<Value, anyhow::Error>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
{
    async fn execute(&self, job: Job) -> Result<Value, anyhow::Error> {
        (self)(job).await
    }
}

/// A registered capability: name, handler and retry policy.
#[derive(Clone)]
pub struct JobType {
    name: String,
    handler: Arc<dyn JobHandler>,
    max_retry: u32,
    concurrency_limit: Option<usize>,
    backoff: Option<BackoffPolicy>,
}

impl JobType {
    pub fn new(name: impl Into<String>, handler: impl JobHandler) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            max_retry: 0,
            concurrency_limit: None,
            backoff: None,
        }
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Overrides the queue-wide retry backoff for this type.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_limit(&self) -> u32 {
        self.max_retry
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency_limit
    }

    pub fn retry_backoff(&self) -> Option<&BackoffPolicy> {
        self.backoff.as_ref()
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }
}

impl fmt::Debug for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobType")
            .field("name", &self.name)
            .field("max_retry", &self.max_retry)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Name to job type lookup.
///
/// Types are registered once. Replacing a registration is not supported and is rejected.
#[derive(Debug, Default)]
pub struct JobTypeRegistry {
    types: HashMap<String, JobType>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType) -> Result<(), QueueError> {
        if job_type.name.trim().is_empty() {
            return Err(QueueError::InvalidJobType);
        }
        if self.types.contains_key(&job_type.name) {
            return Err(QueueError::JobTypeAlreadyRegistered(job_type.name));
        }
        self.types.insert(job_type.name.clone(), job_type);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&JobType, QueueError> {
        self.types
            .get(name)
            .ok_or_else(|| QueueError::UnknownJobType(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}
