use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backlog::Backlog;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::{Job, NewJob};
use crate::job_handle::JobHandle;
use crate::registry::{JobType, JobTypeRegistry};
use crate::store::JobStore;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Created, storage not yet checked.
    Starting,
    Ready,
    /// Storage could not be reached during start-up.
    Failed,
    ShutDown,
}

/// The queue: job types, per-type backlogs and the store, shared by every worker.
///
/// Cloning is cheap and every clone refers to the same queue.
pub struct Queue<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    store: S,
    config: QueueConfig,
    registry: RwLock<JobTypeRegistry>,
    backlogs: RwLock<HashMap<String, Arc<Mutex<Backlog>>>>,
    events: EventBus,
    status: watch::Sender<QueueStatus>,
    shutdown: CancellationToken,
}

impl<S> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for Queue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: JobStore> Queue<S> {
    pub fn new(store: S, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let (status, _) = watch::channel(QueueStatus::Starting);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                events: EventBus::new(config.event_capacity),
                config,
                registry: RwLock::new(JobTypeRegistry::new()),
                backlogs: RwLock::new(HashMap::new()),
                status,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Notifications sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> QueueStatus {
        *self.inner.status.borrow()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Checks that storage is reachable and prepares it, then declares the queue ready.
    ///
    /// On failure the queue stays unusable and an error notification is sent.
    #[instrument(skip_all, err)]
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.status() == QueueStatus::ShutDown {
            return Err(QueueError::ShuttingDown);
        }
        let store = &self.inner.store;
        let checked = match store.ping().await {
            Ok(()) => store.setup().await,
            Err(err) => Err(err),
        };
        match checked {
            Ok(()) => {
                self.inner.status.send_replace(QueueStatus::Ready);
                info!("Queue ready");
                self.inner.events.publish(QueueEvent::Ready);
                Ok(())
            }
            Err(err) => {
                self.inner.status.send_replace(QueueStatus::Failed);
                self.report_error(&err);
                Err(err)
            }
        }
    }

    /// Stops handing out jobs. Jobs already claimed are left to finish.
    pub fn shutdown(&self) {
        let previous = self.inner.status.send_replace(QueueStatus::ShutDown);
        if previous == QueueStatus::ShutDown {
            return;
        }
        self.inner.shutdown.cancel();
        info!("Queue shutting down");
        self.inner.events.publish(QueueEvent::Shutdown);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn report_error(&self, err: &QueueError) {
        error!(error = %err, "Queue error");
        self.inner.events.publish(QueueEvent::Error(err.to_string()));
    }

    #[instrument(skip_all, err, fields(job_type = job_type.name()))]
    pub async fn register_job_type(&self, job_type: JobType) -> Result<(), QueueError> {
        let capacity = self.inner.config.backlog_capacity(job_type.concurrency());
        let name = job_type.name().to_string();

        // the backlog is in place before the registry lock is released, so a type that
        // resolves always has one
        {
            let mut registry = self.inner.registry.write().await;
            if let Err(err) = registry.register(job_type.clone()) {
                drop(registry);
                self.report_error(&err);
                return Err(err);
            }
            self.inner.backlogs.write().await.insert(
                name,
                Arc::new(Mutex::new(Backlog::new(
                    capacity,
                    self.inner.config.backlog_low_water,
                ))),
            );
        }
        self.inner.events.publish(QueueEvent::RegisterJobType(job_type));
        Ok(())
    }

    pub async fn job_type(&self, name: &str) -> Result<JobType, QueueError> {
        self.inner.registry.read().await.resolve(name).cloned()
    }

    /// Submits jobs of a single registered type.
    ///
    /// Every job is validated before anything is written, and the batch is persisted as one
    /// atomic write: either all jobs are queued or none is. Jobs that are already due go
    /// straight into the backlog.
    #[instrument(skip_all, err, fields(job_type, count))]
    pub async fn submit(
        &self,
        jobs: impl IntoIterator<Item = NewJob>,
    ) -> Result<Vec<Job>, QueueError> {
        self.ensure_ready()?;
        let jobs: Vec<NewJob> = jobs.into_iter().collect();
        let Some(first) = jobs.first() else {
            return Ok(Vec::new());
        };
        let type_name = first.job_type.clone();
        tracing::Span::current().record("job_type", type_name.as_str());
        tracing::Span::current().record("count", jobs.len());

        for job in &jobs {
            if job.job_type.is_empty() {
                return Err(QueueError::MissingJobType);
            }
            if job.job_type != type_name {
                return Err(QueueError::MixedJobTypes {
                    expected: type_name,
                    found: job.job_type.clone(),
                });
            }
        }
        self.job_type(&type_name).await?;
        let backlog = self.backlog(&type_name).await?;

        let now = Utc::now();
        let jobs: Vec<Job> = jobs.into_iter().map(|job| job.build(now)).collect();

        if let Err(err) = self.inner.store.insert(&jobs).await {
            self.report_error(&err);
            return Err(err);
        }

        let offered = {
            let mut backlog = backlog.lock().await;
            let now = Utc::now();
            jobs.iter().filter(|job| backlog.offer(job, now)).count()
        };
        debug!(offered, "Queued jobs");

        self.inner.events.publish(QueueEvent::QueueJobs(jobs.clone()));
        Ok(jobs)
    }

    pub async fn submit_one(&self, job: NewJob) -> Result<Job, QueueError> {
        let mut jobs = self.submit([job]).await?;
        jobs.pop()
            .ok_or_else(|| QueueError::Storage(anyhow::anyhow!("Submission returned no job")))
    }

    /// Reads eligible jobs from storage into the type's backlog. Returns how many were added.
    pub async fn refill(&self, type_name: &str) -> Result<usize, QueueError> {
        let job_type = self.job_type(type_name).await?;
        let backlog = self.backlog(type_name).await?;
        let mut backlog = backlog.lock().await;
        self.refill_locked(&job_type, &mut backlog, Utc::now()).await
    }

    pub async fn backlog_len(&self, type_name: &str) -> Result<usize, QueueError> {
        Ok(self.backlog(type_name).await?.lock().await.len())
    }

    /// Takes the next job of the given type and claims it.
    ///
    /// Backlog entries whose claim is rejected were picked up elsewhere and are dropped.
    /// `None` means nothing is due right now, or the queue is shutting down.
    #[instrument(skip_all, err, fields(job_type = type_name))]
    pub async fn next_job(&self, type_name: &str) -> Result<Option<JobHandle<S>>, QueueError> {
        if self.is_shut_down() {
            return Ok(None);
        }
        self.ensure_ready()?;
        let job_type = self.job_type(type_name).await?;
        let backoff = job_type
            .retry_backoff()
            .cloned()
            .unwrap_or_else(|| self.inner.config.retry_backoff.clone());
        let backlog = self.backlog(type_name).await?;

        loop {
            let now = Utc::now();
            let entry = {
                let mut backlog = backlog.lock().await;
                match backlog.take(now) {
                    Some(entry) => Some(entry),
                    None => {
                        self.refill_locked(&job_type, &mut backlog, now).await?;
                        backlog.take(now)
                    }
                }
            };
            let Some(entry) = entry else {
                return Ok(None);
            };

            let store = &self.inner.store;
            match store.claim(&entry.id, entry.run_count, Utc::now()).await? {
                Some(job) => {
                    debug!(jid = %job.id, run_count = job.run_count, "Claimed job");
                    self.top_up(&job_type, &backlog).await;
                    return Ok(Some(JobHandle::new(job, job_type, backoff, store.clone())));
                }
                None => debug!(jid = %entry.id, "Claim lost, dropping backlog entry"),
            }
        }
    }

    /// Refills ahead of demand once the backlog runs below its low-water mark.
    async fn top_up(&self, job_type: &JobType, backlog: &Mutex<Backlog>) {
        let mut backlog = backlog.lock().await;
        let now = Utc::now();
        if !backlog.needs_refill(now, self.inner.config.refill_interval) {
            return;
        }
        if let Err(err) = self.refill_locked(job_type, &mut backlog, now).await {
            warn!(error = %err, "Failed to top up backlog");
        }
    }

    /// Removes a job that has not been claimed yet.
    #[instrument(skip_all, err, fields(jid = id))]
    pub async fn cancel_job(&self, id: &str) -> Result<(), QueueError> {
        if !self.inner.store.cancel(id).await? {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        for backlog in self.inner.backlogs.read().await.values() {
            if backlog.lock().await.remove(id) {
                break;
            }
        }
        Ok(())
    }

    pub async fn job(&self, id: &str) -> Result<Job, QueueError> {
        self.inner
            .store
            .find(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    /// Spawns one worker per unit of the type's concurrency limit (at least one).
    pub async fn spawn_workers(&self, type_name: &str) -> Result<WorkerPool, QueueError> {
        let job_type = self.job_type(type_name).await?;
        Ok(WorkerPool::spawn(
            self,
            type_name,
            job_type.concurrency().unwrap_or(1),
        ))
    }

    fn ensure_ready(&self) -> Result<(), QueueError> {
        match self.status() {
            QueueStatus::Ready => Ok(()),
            QueueStatus::ShutDown => Err(QueueError::ShuttingDown),
            QueueStatus::Starting | QueueStatus::Failed => Err(QueueError::NotReady),
        }
    }

    async fn backlog(&self, type_name: &str) -> Result<Arc<Mutex<Backlog>>, QueueError> {
        self.inner
            .backlogs
            .read()
            .await
            .get(type_name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownJobType(type_name.to_string()))
    }

    async fn refill_locked(
        &self,
        job_type: &JobType,
        backlog: &mut Backlog,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let limit = backlog.spare();
        if limit == 0 {
            return Ok(0);
        }
        let jobs = self
            .inner
            .store
            .list_eligible(job_type.name(), limit, job_type.retry_limit(), now)
            .await?;
        let added = backlog.refill(jobs, now);
        debug!(job_type = job_type.name(), added, occupancy = backlog.len(), "Refilled backlog");
        Ok(added)
    }
}
