use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::job::Job;
use crate::lifecycle;
use crate::store::JobStore;

/// Process-local store. Nothing survives a restart; useful for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail as if the store could not be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("Memory store is unavailable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn ping(&self) -> Result<(), QueueError> {
        self.check_available()
    }

    async fn insert(&self, jobs: &[Job]) -> Result<(), QueueError> {
        self.check_available()?;
        let mut stored = self.jobs.lock().await;
        let mut seen = std::collections::HashSet::new();
        for job in jobs {
            if stored.contains_key(&job.id) || !seen.insert(job.id.as_str()) {
                return Err(anyhow!("Duplicate job id {}", job.id).into());
            }
        }
        for job in jobs {
            stored.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }

    async fn update(&self, jobs: &[Job]) -> Result<(), QueueError> {
        self.check_available()?;
        let mut stored = self.jobs.lock().await;
        if let Some(missing) = jobs.iter().find(|job| !stored.contains_key(&job.id)) {
            return Err(anyhow!("Cannot update unknown job {}", missing.id).into());
        }
        for job in jobs {
            stored.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }

    async fn list_eligible(
        &self,
        job_type: &str,
        limit: usize,
        max_retry: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        self.check_available()?;
        let stored = self.jobs.lock().await;
        let mut eligible: Vec<Job> = stored
            .values()
            .filter(|job| job.job_type == job_type && job.is_eligible(max_retry, now))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            a.desired_run_time
                .cmp(&b.desired_run_time)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.queue_time.cmp(&b.queue_time))
        });
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn claim(
        &self,
        id: &str,
        expected_run_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        self.check_available()?;
        let mut stored = self.jobs.lock().await;
        let Some(job) = stored.get_mut(id) else {
            return Ok(None);
        };
        if lifecycle::claim(job, expected_run_count, now) {
            Ok(Some(job.clone()))
        } else {
            Ok(None)
        }
    }

    async fn find(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.check_available()?;
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        self.check_available()?;
        let mut stored = self.jobs.lock().await;
        let claimable = stored
            .get(id)
            .map(|job| job.actual_run_time.is_none() && job.end_time.is_none())
            .unwrap_or(false);
        if claimable {
            stored.remove(id);
        }
        Ok(claimable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use chrono::Duration;

    fn job(job_type: &str, now: DateTime<Utc>) -> Job {
        NewJob::new(job_type).build(now)
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let existing = job("email", now);
        store.insert(&[existing.clone()]).await.unwrap();

        let batch = vec![job("email", now), existing, job("email", now)];
        assert!(store.insert(&batch).await.is_err());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn batch_update_is_all_or_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut stored = job("email", now);
        store.insert(&[stored.clone()]).await.unwrap();

        stored.priority = 7;
        let unknown = job("email", now);
        assert!(store.update(&[stored.clone(), unknown]).await.is_err());
        assert_eq!(store.find(&stored.id).await.unwrap().unwrap().priority, 0);
    }

    #[tokio::test]
    async fn list_eligible_filters_and_orders() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let early = NewJob::new("email").run_at(now - Duration::seconds(5)).build(now);
        let urgent = NewJob::new("email").priority(10).build(now);
        let normal = job("email", now);
        let future = NewJob::new("email").run_at(now + Duration::minutes(1)).build(now);
        let other = job("fetch", now);
        let mut exhausted = job("email", now);
        exhausted.run_count = 3;
        store
            .insert(&[
                normal.clone(),
                urgent.clone(),
                early.clone(),
                future,
                other,
                exhausted,
            ])
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_eligible("email", 10, 2, now)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(ids, vec![early.id.clone(), urgent.id, normal.id]);

        let limited = store.list_eligible("email", 1, 2, now).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, early.id);
    }

    #[tokio::test]
    async fn only_one_of_two_racing_claims_wins() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let pending = job("email", now);
        store.insert(&[pending.clone()]).await.unwrap();

        let (a, b) = tokio::join!(
            store.claim(&pending.id, 0, now),
            store.claim(&pending.id, 0, now)
        );
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);

        let stored = store.find(&pending.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert!(stored.actual_run_time.is_some());
        assert!(store.list_eligible("email", 10, 5, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_only_removes_unclaimed_jobs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = job("email", now);
        let b = job("email", now);
        store.insert(&[a.clone(), b.clone()]).await.unwrap();
        store.claim(&b.id, 0, now).await.unwrap();

        assert!(store.cancel(&a.id).await.unwrap());
        assert!(!store.cancel(&a.id).await.unwrap());
        assert!(!store.cancel(&b.id).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_everything() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        assert!(store.insert(&[job("email", Utc::now())]).await.is_err());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
        assert!(store.is_empty().await);
    }
}
