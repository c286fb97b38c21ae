use chrono::Utc;
use std::sync::Arc;

use crate::models::api::{DeadLetterList, RedriveResponse, ReprocessResponse};
use crate::models::job::{partition_key_for, JobKey, JobRecord, JobStatus, KeyLayout, META_SORT_KEY};
use crate::models::message::QueueMessage;
use crate::services::queue::{Queue, QueueError};
use crate::services::state::{Condition, StateError, StateStore};

/// Operator actions on failed jobs and the dead-letter queue.
pub struct JobAdmin {
    state: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    layout: KeyLayout,
    record_ttl: Option<chrono::Duration>,
}

impl JobAdmin {
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
        }
    }

    /// Reset a `FAILED` job to `PENDING` and enqueue a fresh message for it.
    pub async fn reprocess(&self, job_id: &str) -> Result<ReprocessResponse, AdminError> {
        let record = self.meta(job_id).await?;
        if record.status != JobStatus::Failed {
            return Err(AdminError::NotFailed {
                job_id: job_id.to_string(),
                status: record.status,
            });
        }

        let reset = self.reset(job_id, &record).await?;
        let job = JobKey {
            job_id: job_id.to_string(),
            object_key: reset.object_key.clone(),
        };
        let message_id = self.queue.enqueue(&QueueMessage::new(&job)).await?;

        tracing::info!(job_id, attempt = reset.attempt, message_id = %message_id, "Job queued for reprocessing");
        metrics::counter!("admin_reprocess_total").increment(1);
        Ok(ReprocessResponse {
            job_id: job_id.to_string(),
            attempt: reset.attempt,
            message_id,
        })
    }

    /// Move a dead letter back to the main queue. A `FAILED` record is reset
    /// first so the redelivered message is claimed as a fresh attempt.
    pub async fn replay_dead_letter(&self, message_id: &str) -> Result<RedriveResponse, AdminError> {
        let dead = self
            .queue
            .dead_letter(message_id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("dead letter {}", message_id)))?;

        let job = dead.message.job(&self.layout);
        if let Some(job) = &job {
            match self.state.get(&job.partition_key(), META_SORT_KEY).await {
                Ok(record) if record.status == JobStatus::Failed => {
                    self.reset(&job.job_id, &record).await?;
                }
                Ok(_) | Err(StateError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.queue.redrive(message_id).await?;
        tracing::info!(message_id, job_id = ?job.as_ref().map(|j| &j.job_id), "Dead letter redriven");
        metrics::counter!("admin_redrive_total").increment(1);
        Ok(RedriveResponse {
            message_id: message_id.to_string(),
            job_id: job.map(|j| j.job_id),
        })
    }

    pub async fn dead_letters(&self, offset: usize, limit: usize) -> Result<DeadLetterList, AdminError> {
        let depth = self.queue.depth().await?;
        let entries = self.queue.dead_letters(offset, limit).await?;
        Ok(DeadLetterList { depth, entries })
    }

    async fn meta(&self, job_id: &str) -> Result<JobRecord, AdminError> {
        match self.state.get(&partition_key_for(job_id), META_SORT_KEY).await {
            Ok(record) => Ok(record),
            Err(StateError::NotFound) => Err(AdminError::NotFound(format!("job {}", job_id))),
            Err(e) => Err(e.into()),
        }
    }

    async fn reset(&self, job_id: &str, record: &JobRecord) -> Result<JobRecord, AdminError> {
        let reset = record.reset_for_reprocess(Utc::now(), self.record_ttl);
        match self.state.put(&reset, Some(Condition::unchanged(record))).await {
            Ok(()) => {}
            Err(StateError::ConditionFailed) => return Err(AdminError::Conflict(job_id.to_string())),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.state.put(&reset.event_snapshot(), None).await {
            tracing::debug!(job_id, error = %e, "Failed to write transition snapshot");
        }
        Ok(reset)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} is {status}, only FAILED jobs can be reprocessed")]
    NotFailed { job_id: String, status: JobStatus },

    #[error("Job {0} changed concurrently, retry the request")]
    Conflict(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    State(#[from] StateError),
}
