use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Sort key of the live job record.
pub const META_SORT_KEY: &str = "META";

/// Sort-key prefix of the append-only transition snapshots.
pub const EVENT_SORT_PREFIX: &str = "EVENT#";

const PARTITION_PREFIX: &str = "video#";

/// Lifecycle status of an analysis job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

/// Diagnostic attached to a `FAILED` record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub delivery_count: u32,
    /// Message whose delivery wrote this failure. Only its redeliveries
    /// may claim the job again.
    #[serde(default)]
    pub message_id: Option<String>,
    /// True when no further queue redelivery will retry this job.
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Durable record of one job, keyed by `(partition_key, sort_key)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub partition_key: String,
    pub sort_key: String,
    pub status: JobStatus,
    pub object_key: String,
    pub result_key: Option<String>,
    pub attempt: u32,
    pub error_info: Option<ErrorInfo>,
    #[serde(with = "chrono::serde::ts_seconds_option", default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh `PENDING` META record for a newly observed upload.
    pub fn pending(job: &JobKey, now: DateTime<Utc>, ttl: Option<chrono::Duration>) -> Self {
        Self {
            partition_key: job.partition_key(),
            sort_key: META_SORT_KEY.to_string(),
            status: JobStatus::Pending,
            object_key: job.object_key.clone(),
            result_key: None,
            attempt: 0,
            error_info: None,
            expires_at: ttl.map(|ttl| now + ttl),
            created_at: now,
            updated_at: now,
        }
    }

    /// The record a worker writes when it claims the job.
    pub fn claimed(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Processing,
            result_key: None,
            attempt: self.attempt + 1,
            error_info: None,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn succeeded(
        &self,
        result_key: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Option<chrono::Duration>,
    ) -> Self {
        Self {
            status: JobStatus::Succeeded,
            result_key: Some(result_key.into()),
            error_info: None,
            expires_at: ttl.map(|ttl| now + ttl).or(self.expires_at),
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn failed(
        &self,
        error: ErrorInfo,
        now: DateTime<Utc>,
        ttl: Option<chrono::Duration>,
    ) -> Self {
        Self {
            status: JobStatus::Failed,
            result_key: None,
            error_info: Some(error),
            expires_at: ttl.map(|ttl| now + ttl).or(self.expires_at),
            updated_at: now,
            ..self.clone()
        }
    }

    /// Administrative reset of a `FAILED` job back to `PENDING`.
    pub fn reset_for_reprocess(&self, now: DateTime<Utc>, ttl: Option<chrono::Duration>) -> Self {
        Self {
            status: JobStatus::Pending,
            result_key: None,
            attempt: self.attempt + 1,
            error_info: None,
            expires_at: ttl.map(|ttl| now + ttl).or(self.expires_at),
            updated_at: now,
            ..self.clone()
        }
    }

    /// Copy of this record stored under an `EVENT#` sort key.
    pub fn event_snapshot(&self) -> Self {
        Self {
            sort_key: format!("{}{:04}#{}", EVENT_SORT_PREFIX, self.attempt, self.status),
            ..self.clone()
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn job_id(&self) -> Option<&str> {
        job_id_from_partition_key(&self.partition_key)
    }
}

/// Identity of one job: the id exposed to clients and the source object it
/// was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKey {
    pub job_id: String,
    pub object_key: String,
}

impl JobKey {
    pub fn partition_key(&self) -> String {
        partition_key_for(&self.job_id)
    }
}

pub fn partition_key_for(job_id: &str) -> String {
    format!("{}{}", PARTITION_PREFIX, job_id)
}

pub fn job_id_from_partition_key(partition_key: &str) -> Option<&str> {
    partition_key
        .strip_prefix(PARTITION_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Object-store naming scheme shared by the API, the notifier and the
/// workers.
///
/// Uploads live at `<ingest_prefix><job_id><ingest_suffix>` and results at
/// `<result_prefix><job_id>/output.json`. The result key depends only on the
/// job id, so a repeated run overwrites the same object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    pub ingest_prefix: String,
    pub ingest_suffix: String,
    pub result_prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            ingest_prefix: "raw/".to_string(),
            ingest_suffix: ".zip".to_string(),
            result_prefix: "results/".to_string(),
        }
    }
}

impl KeyLayout {
    pub fn matches(&self, object_key: &str) -> bool {
        self.job_for_object(object_key).is_some()
    }

    /// Derive the job identity from an uploaded object's key, or `None` if
    /// the key falls outside the ingestion filter.
    pub fn job_for_object(&self, object_key: &str) -> Option<JobKey> {
        let job_id = object_key
            .strip_prefix(&self.ingest_prefix)?
            .strip_suffix(&self.ingest_suffix)?;
        if job_id.is_empty() {
            return None;
        }
        Some(JobKey {
            job_id: job_id.to_string(),
            object_key: object_key.to_string(),
        })
    }

    pub fn object_key_for(&self, job_id: &str) -> String {
        format!("{}{}{}", self.ingest_prefix, job_id, self.ingest_suffix)
    }

    pub fn result_key_for(&self, job_id: &str) -> String {
        format!("{}{}/output.json", self.result_prefix, job_id)
    }
}
