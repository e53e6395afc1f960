#![forbid(unsafe_code)]
//! A durable, typed job queue.
//!
//! Jobs are persisted through a [`JobStore`] (MongoDB or in-memory) and handed to workers
//! through a per-type in-memory backlog, so most claims don't need a storage read first.
//! A claim is a conditional update on the job's `run_count`, which keeps two workers from
//! running the same attempt. Failed jobs are retried with exponential backoff until their
//! type's `max_retry` is used up.
//!
//! ```no_run
//! use qq_mongodb::prelude::*;
//! use serde_json::{json, Value};
//!
//! async fn send_email(job: Job) -> Result<Value, anyhow::Error> {
//!     Ok(json!({ "sent_to": job.data["to"] }))
//! }
//!
//! # async fn run() -> Result<(), QueueError> {
//! let config = QueueConfig::from_env();
//! let store = MongoDbStore::new(&config.database_url, config.database_cert_file.clone())
//!     .await
//!     .map_err(anyhow::Error::from)?;
//! let queue = Queue::new(store, config)?;
//! queue.start().await?;
//! queue
//!     .register_job_type(JobType::new("email", send_email).max_retry(3).concurrency_limit(4))
//!     .await?;
//!
//! queue.submit_one(NewJob::new("email").data(json!({ "to": "a@b.c" }))).await?;
//!
//! let workers = queue.spawn_workers("email").await?;
//! queue.shutdown();
//! workers.join().await;
//! # Ok(())
//! # }
//! ```

mod backlog;
mod events;
mod job;
mod job_handle;
mod queue;
mod registry;
mod types;
mod worker;

pub mod backoff;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod store;

pub use backlog::Backlog;
pub use backoff::BackoffPolicy;
pub use config::QueueConfig;
pub use error::QueueError;
pub use events::QueueEvent;
pub use job::{Job, JobState, NewJob};
pub use job_handle::JobHandle;
pub use lifecycle::Resolution;
pub use queue::{Queue, QueueStatus};
pub use registry::{JobHandler, JobType, JobTypeRegistry};
pub use store::{JobStore, MemoryStore, MongoDbStore};
pub use worker::{Worker, WorkerPool};

/// Re-exports to simplify importing this crate's types.
pub mod prelude {
    pub use super::{
        BackoffPolicy, Job, JobHandle, JobHandler, JobState, JobStore, JobType, MemoryStore,
        MongoDbStore, NewJob, Queue, QueueConfig, QueueError, QueueEvent, QueueStatus,
        Resolution, Worker, WorkerPool,
    };
    pub use async_trait::async_trait;
}
