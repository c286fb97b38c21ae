use chrono::Utc;
use std::sync::Arc;

use crate::models::event::ObjectCreatedEvent;
use crate::models::job::{JobRecord, KeyLayout};
use crate::models::message::QueueMessage;
use crate::services::queue::{Queue, QueueError};
use crate::services::retry::{retry_async, RetryPolicy};
use crate::services::state::{Condition, StateError, StateStore};

/// What the notifier did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The key is outside the ingestion filter.
    Skipped,
    Enqueued {
        job_id: String,
        message_id: String,
        /// A record for this job already existed (repeated notification).
        duplicate: bool,
    },
}

/// Turns object-created events into queue messages.
///
/// Repeated notifications for the same object are expected and each one
/// produces a message; the worker's claim protocol absorbs the duplicates.
pub struct IngestionNotifier {
    state: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    layout: KeyLayout,
    record_ttl: Option<chrono::Duration>,
    retry: RetryPolicy,
}

impl IngestionNotifier {
    pub fn new(
        state: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        layout: KeyLayout,
        record_ttl: Option<chrono::Duration>,
    ) -> Self {
        Self {
            state,
            queue,
            layout,
            record_ttl,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn notify(&self, event: &ObjectCreatedEvent) -> Result<NotifyOutcome, NotifyError> {
        let Some(job) = self.layout.job_for_object(&event.object_key) else {
            tracing::debug!(object_key = %event.object_key, "Object outside ingestion filter, skipping");
            metrics::counter!("ingest_events_total", "outcome" => "skipped").increment(1);
            return Ok(NotifyOutcome::Skipped);
        };

        // Best effort: a worker claim creates the record if this write is lost.
        let pending = JobRecord::pending(&job, Utc::now(), self.record_ttl);
        let duplicate = match self.state.put(&pending, Some(Condition::NotExists)).await {
            Ok(()) => {
                if let Err(e) = self.state.put(&pending.event_snapshot(), None).await {
                    tracing::debug!(job_id = %job.job_id, error = %e, "Failed to record PENDING snapshot");
                }
                false
            }
            Err(StateError::ConditionFailed) => true,
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "Failed to create job record, enqueueing anyway");
                false
            }
        };

        let message = QueueMessage::new(&job);
        let queue = &self.queue;
        let message_id = retry_async(&self.retry, "enqueue", QueueError::is_transient, || {
            queue.enqueue(&message)
        })
        .await
        .map_err(|e| {
            metrics::counter!("ingest_events_total", "outcome" => "failed").increment(1);
            NotifyError::Enqueue {
                object_key: event.object_key.clone(),
                source: e,
            }
        })?;

        tracing::info!(
            job_id = %job.job_id,
            object_key = %event.object_key,
            message_id = %message_id,
            event_time = %event.event_time,
            duplicate,
            "Upload enqueued for analysis"
        );
        metrics::counter!("ingest_events_total", "outcome" => "enqueued").increment(1);

        Ok(NotifyOutcome::Enqueued {
            job_id: job.job_id,
            message_id,
            duplicate,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to enqueue {object_key}: {source}")]
    Enqueue {
        object_key: String,
        #[source]
        source: QueueError,
    },
}
