use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    options::{
        ClientOptions, ConnectionString, FindOneAndUpdateOptions, FindOptions, IndexOptions,
        ReturnDocument, Tls, TlsOptions,
    },
    Client, Collection, Database, IndexModel,
};
use tracing::instrument;

use crate::error::QueueError;
use crate::job::Job;
use crate::store::JobStore;
use crate::types::{to_bson_date, JobRow};

const JOBS_COLLECTION: &str = "qq_jobs";

/// Job storage backed by MongoDB.
///
/// Writes of a single job are plain single-document writes and work against a standalone
/// server. Batches of two or more run inside a transaction, which MongoDB only allows on a
/// replica set or sharded cluster.
#[derive(Clone, Debug)]
pub struct MongoDbStore {
    database: Database,
}

impl MongoDbStore {
    pub async fn new(uri: &str, cert_file: Option<String>) -> Result<Self, mongodb::error::Error> {
        let client = Self::new_client(uri, cert_file).await?;
        let database = client.default_database().unwrap_or(client.database("qq"));

        Ok(Self { database })
    }

    pub fn from_database(database: Database) -> Self {
        Self { database }
    }

    async fn new_client(
        uri: &str,
        cert_path: Option<String>,
    ) -> Result<Client, mongodb::error::Error> {
        match cert_path {
            Some(cert_path) => {
                let conn_str = ConnectionString::parse(uri)?;
                let mut options = ClientOptions::parse_connection_string(conn_str).await?;
                let mut tls_options = TlsOptions::default();
                tls_options.ca_file_path = Some(cert_path.into());
                options.tls = Some(Tls::Enabled(tls_options));
                Client::with_options(options)
            }
            None => Client::with_uri_str(uri).await,
        }
    }

    #[cfg(test)]
    pub async fn delete_database(&self) -> Result<(), mongodb::error::Error> {
        self.database.drop(None).await
    }

    fn collection(&self) -> Collection<JobRow> {
        self.database.collection(JOBS_COLLECTION)
    }

    fn rows(jobs: &[Job]) -> Result<Vec<JobRow>, anyhow::Error> {
        jobs.iter().map(JobRow::try_from).collect()
    }
}

#[async_trait]
impl JobStore for MongoDbStore {
    #[instrument(skip_all, err)]
    async fn ping(&self) -> Result<(), QueueError> {
        self.database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .context("Failed to reach MongoDB")?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn setup(&self) -> Result<(), QueueError> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "jid": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "job_type": 1, "desired_run_time": 1, "priority": -1 })
                .build(),
        ];
        self.collection()
            .create_indexes(indexes, None)
            .await
            .context("Failed to create job indexes")?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(count = jobs.len()))]
    async fn insert(&self, jobs: &[Job]) -> Result<(), QueueError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let rows = Self::rows(jobs)?;
        let collection = self.collection();

        if let [row] = rows.as_slice() {
            collection
                .insert_one(row, None)
                .await
                .context("Failed to add job to the queue")?;
            return Ok(());
        }

        let mut session = collection
            .client()
            .start_session(None)
            .await
            .context("Failed to start session")?;
        session
            .start_transaction(None)
            .await
            .context("Failed to start transaction")?;

        collection
            .insert_many_with_session(rows, None, &mut session)
            .await
            .context("Failed to add jobs to the queue")?;

        session
            .commit_transaction()
            .await
            .context("Failed to commit transaction")?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(count = jobs.len()))]
    async fn update(&self, jobs: &[Job]) -> Result<(), QueueError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let rows = Self::rows(jobs)?;
        let collection = self.collection();

        if let [row] = rows.as_slice() {
            let result = collection
                .replace_one(doc! { "jid": row.jid.as_str() }, row, None)
                .await
                .context("Failed to update job")?;
            if result.matched_count == 0 {
                return Err(anyhow!("Cannot update unknown job {}", row.jid).into());
            }
            return Ok(());
        }

        let mut session = collection
            .client()
            .start_session(None)
            .await
            .context("Failed to start session")?;
        session
            .start_transaction(None)
            .await
            .context("Failed to start transaction")?;

        for row in rows {
            let result = collection
                .replace_one_with_session(
                    doc! { "jid": row.jid.as_str() },
                    &row,
                    None,
                    &mut session,
                )
                .await
                .context("Failed to update job")?;
            if result.matched_count == 0 {
                // dropping the session aborts the transaction
                return Err(anyhow!("Cannot update unknown job {}", row.jid).into());
            }
        }

        session
            .commit_transaction()
            .await
            .context("Failed to commit transaction")?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_type = job_type, limit = limit))]
    async fn list_eligible(
        &self,
        job_type: &str,
        limit: usize,
        max_retry: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        // a limit of 0 means "no limit" to MongoDB
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = doc! {
            "job_type": job_type,
            "actual_run_time": None::<bson::DateTime>,
            "end_time": None::<bson::DateTime>,
            "run_count": { "$lte": max_retry as i64 },
            "desired_run_time": { "$lte": to_bson_date(now) },
        };
        let options = FindOptions::builder()
            .sort(doc! { "desired_run_time": 1, "priority": -1, "queue_time": 1 })
            .limit(limit as i64)
            .build();

        let rows: Vec<JobRow> = self
            .collection()
            .find(filter, options)
            .await
            .context("Failed to list eligible jobs")?
            .try_collect()
            .await
            .context("Failed to read eligible jobs")?;

        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    #[instrument(skip_all, err, fields(jid = id, expected_run_count = expected_run_count))]
    async fn claim(
        &self,
        id: &str,
        expected_run_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let filter = doc! {
            "jid": id,
            "run_count": expected_run_count as i64,
            "actual_run_time": None::<bson::DateTime>,
            "end_time": None::<bson::DateTime>,
        };
        let update = doc! {
            "$set": { "actual_run_time": to_bson_date(now) },
            "$inc": { "run_count": 1_i64 },
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let row = self
            .collection()
            .find_one_and_update(filter, update, options)
            .await
            .context("Failed to claim job")?;

        Ok(row.map(Job::try_from).transpose()?)
    }

    #[instrument(skip_all, err, fields(jid = id))]
    async fn find(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let row = self
            .collection()
            .find_one(doc! { "jid": id }, None)
            .await
            .context("Failed to find job")?;
        Ok(row.map(Job::try_from).transpose()?)
    }

    #[instrument(skip_all, err, fields(jid = id))]
    async fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        let result = self
            .collection()
            .delete_one(
                doc! {
                    "jid": id,
                    "actual_run_time": None::<bson::DateTime>,
                    "end_time": None::<bson::DateTime>,
                },
                None,
            )
            .await
            .context("Failed to remove job from the queue")?;
        Ok(result.deleted_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::lifecycle;
    use serde_json::json;
    use uuid::Uuid;

    async fn test_store() -> MongoDbStore {
        let uri = std::env::var("QQ_DATABASE_URL")
            .unwrap_or_else(|_| "mongodb://localhost:27017/?replicaSet=rs0".to_string());
        let client = Client::with_uri_str(&uri).await.unwrap();
        let store = MongoDbStore::from_database(
            client.database(&format!("qq_test_{}", Uuid::new_v4().simple())),
        );
        store.setup().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB server at QQ_STANDALONE_DATABASE_URL"]
    async fn single_job_lifecycle_needs_no_replica_set() {
        let uri = std::env::var("QQ_STANDALONE_DATABASE_URL")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let client = Client::with_uri_str(&uri).await.unwrap();
        let store = MongoDbStore::from_database(
            client.database(&format!("qq_test_{}", Uuid::new_v4().simple())),
        );
        store.setup().await.unwrap();
        let now = Utc::now();
        let job = NewJob::new("email").build(now);

        store.insert(&[job.clone()]).await.unwrap();
        let mut claimed = store.claim(&job.id, 0, now).await.unwrap().unwrap();
        lifecycle::fail(
            &mut claimed,
            "smtp down".into(),
            0,
            &crate::backoff::BackoffPolicy::immediate(),
            now,
        );
        store.update(&[claimed]).await.unwrap();

        let stored = store.find(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("smtp down"));
        assert!(store.update(&[NewJob::new("email").build(now)]).await.is_err());

        store.delete_database().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set at QQ_DATABASE_URL"]
    async fn claim_is_conditional_on_run_count() {
        let store = test_store().await;
        let now = Utc::now();
        let job = NewJob::new("email").data(json!({"to": "a@b.c"})).build(now);
        store.insert(&[job.clone()]).await.unwrap();

        let (a, b) = tokio::join!(store.claim(&job.id, 0, now), store.claim(&job.id, 0, now));
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].run_count, 1);
        assert!(store.claim(&job.id, 0, now).await.unwrap().is_none());

        store.delete_database().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set at QQ_DATABASE_URL"]
    async fn duplicate_id_rolls_back_the_whole_batch() {
        let store = test_store().await;
        let now = Utc::now();
        let first = NewJob::new("email").build(now);
        let second = NewJob::new("email").build(now);
        let batch = vec![first.clone(), second, first.clone()];

        assert!(store.insert(&batch).await.is_err());
        assert!(store.list_eligible("email", 10, 0, now).await.unwrap().is_empty());

        store.delete_database().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set at QQ_DATABASE_URL"]
    async fn finished_jobs_are_not_eligible() {
        let store = test_store().await;
        let now = Utc::now();
        let mut job = NewJob::new("email").build(now);
        store.insert(&[job.clone()]).await.unwrap();
        assert_eq!(store.list_eligible("email", 10, 0, now).await.unwrap().len(), 1);

        let mut claimed = store.claim(&job.id, 0, now).await.unwrap().unwrap();
        lifecycle::succeed(&mut claimed, json!("done"), now);
        store.update(&[claimed]).await.unwrap();
        assert!(store.list_eligible("email", 10, 0, now).await.unwrap().is_empty());

        job = store.find(&job.id).await.unwrap().unwrap();
        assert_eq!(job.result, Some(json!("done")));
        assert!(!store.cancel(&job.id).await.unwrap());

        store.delete_database().await.unwrap();
    }
}
