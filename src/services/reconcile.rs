use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::models::job::{ErrorInfo, JobStatus, KeyLayout, META_SORT_KEY};
use crate::models::message::DeadLetter;
use crate::services::queue::Queue;
use crate::services::state::{Condition, StateError, StateStore};

/// `errorInfo.kind` written for jobs whose message was dead-lettered while
/// the record still looked in progress.
pub const DEAD_LETTERED_KIND: &str = "dead_lettered";

const SWEEP_BATCH: usize = 100;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub dead_letters_checked: usize,
    pub marked_failed: usize,
    pub records_purged: u64,
    pub dead_letters_pruned: u64,
}

/// Periodic housekeeping shared by all workers.
///
/// A worker that crashes or loses its lease never writes `FAILED`; once the
/// queue dead-letters that message the record would otherwise stay
/// `PROCESSING` forever. The sweep closes those records, reclaims expired
/// records and drops dead letters past retention.
pub struct Reconciler {
    queue: Arc<dyn Queue>,
    state: Arc<dyn StateStore>,
    layout: KeyLayout,
    record_ttl: Option<chrono::Duration>,
    dead_letter_retention: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        queue: Arc<dyn Queue>,
        state: Arc<dyn StateStore>,
        layout: KeyLayout,
        record_ttl: Option<chrono::Duration>,
        dead_letter_retention: Duration,
    ) -> Self {
        let dead_letter_retention =
            chrono::Duration::from_std(dead_letter_retention).unwrap_or_else(|_| chrono::Duration::days(14));
        Self {
            queue,
            state,
            layout,
            record_ttl,
            dead_letter_retention,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, PipelineError> {
        let mut report = SweepReport::default();

        // Marking a record FAILED leaves the dead letter in place, so
        // offsets stay stable while paging through the whole DLQ.
        let mut offset = 0;
        loop {
            let page = self.queue.dead_letters(offset, SWEEP_BATCH).await?;
            if page.is_empty() {
                break;
            }
            for dead in &page {
                report.dead_letters_checked += 1;
                if self.close_stranded(dead).await? {
                    report.marked_failed += 1;
                }
            }
            offset += SWEEP_BATCH;
        }

        report.records_purged = self.state.purge_expired().await?;
        report.dead_letters_pruned = self
            .queue
            .prune_dead_letters(Utc::now() - self.dead_letter_retention)
            .await?;

        if report.marked_failed > 0 || report.records_purged > 0 || report.dead_letters_pruned > 0 {
            tracing::info!(
                marked_failed = report.marked_failed,
                records_purged = report.records_purged,
                dead_letters_pruned = report.dead_letters_pruned,
                "Reconciliation sweep changed state"
            );
        }
        Ok(report)
    }

    /// Mark the job of `dead` FAILED if its record still looks in progress.
    async fn close_stranded(&self, dead: &DeadLetter) -> Result<bool, PipelineError> {
        let Some(job) = dead.message.job(&self.layout) else {
            return Ok(false);
        };

        let record = match self.state.get(&job.partition_key(), META_SORT_KEY).await {
            Ok(record) => record,
            Err(StateError::NotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        // A record touched after the dead-lettering belongs to a newer
        // message (reprocess or redrive), not to this one.
        if !matches!(record.status, JobStatus::Pending | JobStatus::Processing)
            || record.updated_at > dead.dead_lettered_at
        {
            return Ok(false);
        }

        let info = ErrorInfo {
            kind: DEAD_LETTERED_KIND.to_string(),
            message: format!(
                "message {} was dead-lettered after {} deliveries",
                dead.message_id, dead.message.delivery_count
            ),
            delivery_count: dead.message.delivery_count,
            message_id: Some(dead.message_id.clone()),
            is_final: true,
        };
        let failed = record.failed(info, Utc::now(), self.record_ttl);
        match self.state.put(&failed, Some(Condition::unchanged(&record))).await {
            Ok(()) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    attempt = failed.attempt,
                    message_id = %dead.message_id,
                    "Dead-lettered job marked FAILED"
                );
                if let Err(e) = self.state.put(&failed.event_snapshot(), None).await {
                    tracing::debug!(error = %e, "Failed to write transition snapshot");
                }
                Ok(true)
            }
            // Moved on since we read it; the next sweep looks again.
            Err(StateError::ConditionFailed) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
