//! Durable storage for jobs.
//!
//! The store is the system of record. Batch writes are all-or-nothing and the claim is a
//! single conditional update, which is what keeps two workers from running the same job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::job::Job;

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoDbStore;

#[async_trait]
pub trait JobStore: Clone + Send + Sync + 'static {
    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), QueueError>;

    /// One-time preparation such as index creation. Must be idempotent.
    async fn setup(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Persists new jobs. Either every job is written or none is.
    async fn insert(&self, jobs: &[Job]) -> Result<(), QueueError>;

    /// Overwrites existing jobs by id. Either every job is written or none is.
    async fn update(&self, jobs: &[Job]) -> Result<(), QueueError>;

    /// Unclaimed, unfinished jobs of `job_type` that are due by `now` and have
    /// `run_count <= max_retry`, ordered by desired run time then priority (highest first).
    async fn list_eligible(
        &self,
        job_type: &str,
        limit: usize,
        max_retry: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError>;

    /// Claims a pending job if its stored `run_count` still equals `expected_run_count`,
    /// bumping `run_count` and stamping `actual_run_time` in the same operation.
    ///
    /// Returns the claimed job, or `None` if the precondition no longer holds.
    async fn claim(
        &self,
        id: &str,
        expected_run_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    async fn find(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Deletes a job that has not been claimed. Returns whether anything was removed.
    async fn cancel(&self, id: &str) -> Result<bool, QueueError>;
}
