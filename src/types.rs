use anyhow::Context;
use bson::{Bson, DateTime};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;

/// A job as stored in the `qq_jobs` collection.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobRow {
    pub jid: String,
    pub job_type: String,
    pub data: Bson,
    pub title: String,
    pub priority: i64,
    pub run_count: i64,
    pub queue_time: DateTime,
    pub desired_run_time: DateTime,
    pub actual_run_time: Option<DateTime>,
    pub end_time: Option<DateTime>,
    pub error: Option<String>,
    pub result: Option<Bson>,
}

pub(crate) fn to_bson_date(at: chrono::DateTime<Utc>) -> DateTime {
    DateTime::from_millis(at.timestamp_millis())
}

fn from_bson_date(at: DateTime) -> anyhow::Result<chrono::DateTime<Utc>> {
    Utc.timestamp_millis_opt(at.timestamp_millis())
        .single()
        .with_context(|| format!("Timestamp out of range: {}", at))
}

impl TryFrom<&Job> for JobRow {
    type Error = anyhow::Error;

    fn try_from(job: &Job) -> Result<Self, Self::Error> {
        let result = match &job.result {
            Some(value) => Some(bson::to_bson(value).context("Failed to encode job result")?),
            None => None,
        };
        Ok(Self {
            jid: job.id.clone(),
            job_type: job.job_type.clone(),
            data: bson::to_bson(&job.data).context("Failed to encode job data")?,
            title: job.title.clone(),
            priority: job.priority as i64,
            run_count: job.run_count as i64,
            queue_time: to_bson_date(job.queue_time),
            desired_run_time: to_bson_date(job.desired_run_time),
            actual_run_time: job.actual_run_time.map(to_bson_date),
            end_time: job.end_time.map(to_bson_date),
            error: job.error.clone(),
            result,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let result = match row.result {
            Some(value) => Some(bson::from_bson(value).context("Failed to decode job result")?),
            None => None,
        };
        Ok(Self {
            data: bson::from_bson(row.data).context("Failed to decode job data")?,
            id: row.jid,
            job_type: row.job_type,
            title: row.title,
            priority: i32::try_from(row.priority).context("Job priority out of range")?,
            run_count: u32::try_from(row.run_count).context("Job run count out of range")?,
            queue_time: from_bson_date(row.queue_time)?,
            desired_run_time: from_bson_date(row.desired_run_time)?,
            actual_run_time: row.actual_run_time.map(from_bson_date).transpose()?,
            end_time: row.end_time.map(from_bson_date).transpose()?,
            error: row.error,
            result,
        })
    }
}
