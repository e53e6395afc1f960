//! Worker loop: take, claim, execute, resolve, repeat.

use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::queue::Queue;
use crate::store::JobStore;

/// Pulls jobs of one type until the queue shuts down.
///
/// Each worker runs handlers on its own task, so a slow job only holds up its own worker.
pub struct Worker<S> {
    queue: Queue<S>,
    job_type: String,
    idle: BackoffPolicy,
}

impl<S: JobStore> Worker<S> {
    pub fn new(queue: Queue<S>, job_type: impl Into<String>) -> Self {
        let idle = queue.config().idle_backoff.clone();
        Self {
            queue,
            job_type: job_type.into(),
            idle,
        }
    }

    /// Runs until shutdown. The job in hand when shutdown is signalled still completes.
    #[instrument(skip_all, fields(job_type = %self.job_type))]
    pub async fn run(self) {
        let shutdown = self.queue.shutdown_token();
        let mut idle_rounds = 0u32;

        while !shutdown.is_cancelled() {
            match self.queue.next_job(&self.job_type).await {
                Ok(Some(handle)) => {
                    idle_rounds = 0;
                    if let Err(err) = handle.execute().await {
                        self.queue.report_error(&err);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Failed to fetch next job"),
            }

            let delay = self.idle.delay(idle_rounds);
            idle_rounds = idle_rounds.saturating_add(1);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Worker stopped");
    }
}

/// A set of spawned workers for one job type.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<S: JobStore>(queue: &Queue<S>, job_type: &str, workers: usize) -> Self {
        let handles = (0..workers.max(1))
            .map(|_| tokio::spawn(Worker::new(queue.clone(), job_type).run()))
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to stop. Call after [`Queue::shutdown`].
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Worker task panicked");
            }
        }
    }
}
