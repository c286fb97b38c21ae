use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::job::{JobKey, KeyLayout};

/// Envelope published for every qualifying upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub object_key: String,
    #[serde(default)]
    pub job_partition_key: Option<String>,
    pub enqueue_time: DateTime<Utc>,
    /// Number of times this message has been handed to a consumer,
    /// including the current delivery. Maintained by the queue.
    #[serde(default)]
    pub delivery_count: u32,
}

impl QueueMessage {
    pub fn new(job: &JobKey) -> Self {
        Self {
            object_key: job.object_key.clone(),
            job_partition_key: Some(job.partition_key()),
            enqueue_time: Utc::now(),
            delivery_count: 0,
        }
    }

    /// Resolve the job this message refers to. The partition key embedded
    /// by the publisher wins; otherwise it is derived from the object key.
    pub fn job(&self, layout: &KeyLayout) -> Option<JobKey> {
        let derived = layout.job_for_object(&self.object_key)?;
        Some(match self.job_partition_key.as_deref() {
            Some(pk) => JobKey {
                job_id: super::job::job_id_from_partition_key(pk)
                    .unwrap_or(&derived.job_id)
                    .to_string(),
                object_key: derived.object_key,
            },
            None => derived,
        })
    }
}

/// Token identifying one lease of one message.
///
/// Encoded as `<message id>:<delivery count>`; a handle from an earlier
/// delivery no longer matches once the message has been redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(message_id: &str, delivery_count: u32) -> Self {
        Self(format!("{}:{}", message_id, delivery_count))
    }

    pub fn message_id(&self) -> &str {
        self.0.rsplit_once(':').map(|(id, _)| id).unwrap_or(&self.0)
    }

    pub fn delivery_count(&self) -> u32 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, count)| count.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer together with its lease.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt: ReceiptHandle,
    pub message: QueueMessage,
    /// Local instant at which the visibility timeout runs out.
    pub leased_until: Instant,
}

impl ReceivedMessage {
    pub fn delivery_count(&self) -> u32 {
        self.message.delivery_count
    }
}

/// A message parked in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message_id: String,
    pub message: QueueMessage,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Point-in-time message counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub available: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_handle_encoding() {
        let handle = ReceiptHandle::new("3f0c", 2);
        assert_eq!(handle.as_str(), "3f0c:2");
        assert_eq!(handle.message_id(), "3f0c");
        assert_eq!(handle.delivery_count(), 2);
    }

    #[test]
    fn test_job_derived_when_partition_key_missing() {
        let layout = KeyLayout::default();
        let message: QueueMessage = serde_json::from_value(serde_json::json!({
            "objectKey": "raw/video1.zip",
            "enqueueTime": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(message.delivery_count, 0);
        let job = message.job(&layout).unwrap();
        assert_eq!(job.partition_key(), "video#video1");
    }

    #[test]
    fn test_message_outside_layout_has_no_job() {
        let message = QueueMessage {
            object_key: "tmp/video1.zip".to_string(),
            job_partition_key: None,
            enqueue_time: Utc::now(),
            delivery_count: 1,
        };
        assert!(message.job(&KeyLayout::default()).is_none());
    }
}
