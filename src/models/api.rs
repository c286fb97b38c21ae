use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use super::job::{ErrorInfo, JobRecord, JobStatus};
use super::message::{DeadLetter, QueueDepth};

/// Request for an upload grant. The job id is generated when omitted.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    #[garde(length(min = 1, max = 128), custom(valid_job_id))]
    #[serde(default)]
    pub job_id: Option<String>,
}

fn valid_job_id(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(id) if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
            Err(garde::Error::new(
                "job id may only contain ASCII letters, digits, '-' and '_'",
            ))
        }
        _ => Ok(()),
    }
}

/// Time-limited pre-signed access to one object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub method: String,
    pub url: String,
    pub object_key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    pub job_id: String,
    pub upload: Grant,
}

/// Response for `GET /status/{job_id}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub object_key: String,
    pub result_key: Option<String>,
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<Grant>,
    pub history: Vec<StatusTransition>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub status: JobStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl From<&JobRecord> for StatusTransition {
    fn from(record: &JobRecord) -> Self {
        Self {
            status: record.status,
            attempt: record.attempt,
            at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultResponse {
    pub job_id: String,
    pub download: Grant,
}

/// Notifier webhook summary.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub enqueued: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessResponse {
    pub job_id: String,
    pub attempt: u32,
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_dlq_limit")]
    pub limit: usize,
}

fn default_dlq_limit() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterList {
    pub depth: QueueDepth,
    pub entries: Vec<DeadLetter>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedriveResponse {
    pub message_id: String,
    pub job_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_request_validation() {
        let ok = UploadUrlRequest {
            job_id: Some("video_1-a".to_string()),
        };
        assert!(ok.validate().is_ok());

        let generated = UploadUrlRequest::default();
        assert!(generated.validate().is_ok());

        let traversal = UploadUrlRequest {
            job_id: Some("../etc".to_string()),
        };
        assert!(traversal.validate().is_err());

        let empty = UploadUrlRequest {
            job_id: Some(String::new()),
        };
        assert!(empty.validate().is_err());
    }
}
