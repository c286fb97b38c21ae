use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use crate::error::PipelineError;
use crate::models::job::{ErrorInfo, JobKey, JobRecord, JobStatus, KeyLayout, META_SORT_KEY};
use crate::models::message::ReceivedMessage;
use crate::services::analyzer::Analyzer;
use crate::services::queue::Queue;
use crate::services::reconcile::Reconciler;
use crate::services::state::{Condition, StateError, StateStore};
use crate::services::storage::ObjectStore;

const RESULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    /// Long-poll interval of an empty receive.
    pub wait_time: Duration,
    pub per_message_timeout: Duration,
    /// Commits are abandoned when less than this much lease remains.
    pub lease_margin: Duration,
    pub max_receive_count: u32,
    /// Largest source object the scratch space can hold.
    pub scratch_limit_bytes: u64,
    pub record_ttl: Option<chrono::Duration>,
    pub layout: KeyLayout,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
    pub sweep_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            visibility_timeout: Duration::from_secs(600),
            wait_time: Duration::from_secs(20),
            per_message_timeout: Duration::from_secs(600),
            lease_margin: Duration::from_secs(5),
            max_receive_count: 3,
            scratch_limit_bytes: 10 * 1024 * 1024 * 1024,
            record_ttl: Some(chrono::Duration::days(30)),
            layout: KeyLayout::default(),
            error_backoff: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Result of handling one delivery.
#[derive(Debug)]
pub enum MessageOutcome {
    /// Result written, record `SUCCEEDED`, message acknowledged.
    Succeeded { job_id: String, result_key: String },
    /// The job had already succeeded; the duplicate delivery was acknowledged.
    AlreadySucceeded { job_id: String },
    /// The job was failed by an earlier message; this duplicate was acknowledged.
    Superseded { job_id: String },
    /// Ownership lost (claim race or expired lease); left for redelivery.
    Abandoned { job_id: String, reason: PipelineError },
    /// Processing failed; the message went back to the queue.
    Failed { job_id: Option<String>, error: PipelineError },
}

impl MessageOutcome {
    /// Whether the message was acknowledged.
    pub fn is_acked(&self) -> bool {
        matches!(
            self,
            MessageOutcome::Succeeded { .. }
                | MessageOutcome::AlreadySucceeded { .. }
                | MessageOutcome::Superseded { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            MessageOutcome::Succeeded { .. } => "succeeded",
            MessageOutcome::AlreadySucceeded { .. } => "duplicate",
            MessageOutcome::Superseded { .. } => "superseded",
            MessageOutcome::Abandoned { .. } => "abandoned",
            MessageOutcome::Failed { .. } => "failed",
        }
    }
}

/// Per-message outcomes of one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(String, MessageOutcome)>,
}

impl BatchReport {
    /// Ids of messages that were not acknowledged and will be redelivered
    /// or dead-lettered by the queue.
    pub fn item_failures(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_acked())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

enum Claim {
    Claimed(JobRecord),
    AlreadySucceeded,
    Superseded,
}

/// Drains the ingest queue and runs the analysis for each message.
///
/// Workers hold no state between messages: retry accounting lives in the
/// message's delivery count and the record's attempt counter.
pub struct Worker {
    queue: Arc<dyn Queue>,
    state: Arc<dyn StateStore>,
    objects: Arc<dyn ObjectStore>,
    analyzer: Arc<dyn Analyzer>,
    settings: WorkerSettings,
    reconciler: Option<Reconciler>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn Queue>,
        state: Arc<dyn StateStore>,
        objects: Arc<dyn ObjectStore>,
        analyzer: Arc<dyn Analyzer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            state,
            objects,
            analyzer,
            settings,
            reconciler: None,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.settings.batch_size,
            visibility_timeout_secs = self.settings.visibility_timeout.as_secs(),
            per_message_timeout_secs = self.settings.per_message_timeout.as_secs(),
            max_receive_count = self.settings.max_receive_count,
            "Worker ready, starting job processing loop"
        );

        let mut last_sweep: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(reconciler) = &self.reconciler {
                if last_sweep.map_or(true, |at| at.elapsed() >= self.settings.sweep_interval) {
                    match reconciler.sweep().await {
                        Ok(report) => tracing::debug!(?report, "Reconciliation sweep complete"),
                        Err(e) => tracing::warn!(error = %e, "Reconciliation sweep failed"),
                    }
                    last_sweep = Some(Instant::now());
                }
            }

            let received = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = self.queue.receive(
                    self.settings.batch_size,
                    self.settings.visibility_timeout,
                    self.settings.wait_time,
                ) => received,
            };

            match received {
                Ok(batch) if batch.is_empty() => {
                    tracing::trace!("No messages available");
                }
                Ok(batch) => {
                    let report = self.process_batch(batch).await;
                    let failures = report.item_failures();
                    if !failures.is_empty() {
                        tracing::info!(?failures, "Batch finished with item failures");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive from queue, will retry");
                    tokio::time::sleep(self.settings.error_backoff).await;
                }
            }
        }

        tracing::info!("Worker stopped");
    }

    /// Receive one batch (long-polling) and process it.
    pub async fn poll_once(&self) -> Result<BatchReport, PipelineError> {
        let batch = self
            .queue
            .receive(
                self.settings.batch_size,
                self.settings.visibility_timeout,
                self.settings.wait_time,
            )
            .await?;
        Ok(self.process_batch(batch).await)
    }

    /// Process every message of a batch concurrently. Each message is
    /// acknowledged or released on its own.
    pub async fn process_batch(&self, batch: Vec<ReceivedMessage>) -> BatchReport {
        metrics::counter!("pipeline_messages_received_total").increment(batch.len() as u64);
        let handled = batch.into_iter().map(|received| async move {
            let id = received.message_id.clone();
            (id, self.handle(received).await)
        });
        BatchReport {
            outcomes: futures::future::join_all(handled).await,
        }
    }

    pub async fn handle(&self, received: ReceivedMessage) -> MessageOutcome {
        let span = tracing::info_span!(
            "message",
            message_id = %received.message_id,
            object_key = %received.message.object_key,
            delivery_count = received.delivery_count(),
        );
        let outcome = self.handle_inner(&received).instrument(span).await;
        metrics::counter!("pipeline_messages_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn handle_inner(&self, received: &ReceivedMessage) -> MessageOutcome {
        let Some(job) = received.message.job(&self.settings.layout) else {
            let error = PipelineError::PoisonMessage(format!(
                "object key '{}' is outside the ingestion layout",
                received.message.object_key
            ));
            tracing::error!(error = %error, "Cannot route message");
            self.release(received).await;
            return MessageOutcome::Failed { job_id: None, error };
        };

        let claimed = match self.claim(&job, received).await {
            Ok(Claim::Claimed(record)) => record,
            Ok(Claim::AlreadySucceeded) => {
                tracing::info!(job_id = %job.job_id, "Job already succeeded, acknowledging duplicate");
                self.settle(received).await;
                return MessageOutcome::AlreadySucceeded { job_id: job.job_id };
            }
            Ok(Claim::Superseded) => {
                tracing::info!(job_id = %job.job_id, "Job failed under an earlier message, acknowledging duplicate");
                self.settle(received).await;
                return MessageOutcome::Superseded { job_id: job.job_id };
            }
            Err(PipelineError::ConditionFailed) => {
                tracing::debug!(job_id = %job.job_id, "Lost claim race, leaving message to redeliver");
                metrics::counter!("pipeline_claims_lost_total").increment(1);
                return MessageOutcome::Abandoned {
                    job_id: job.job_id,
                    reason: PipelineError::ConditionFailed,
                };
            }
            Err(error) => {
                tracing::warn!(job_id = %job.job_id, error = %error, "Failed to claim job");
                self.release(received).await;
                return MessageOutcome::Failed {
                    job_id: Some(job.job_id),
                    error,
                };
            }
        };

        let (deadline, bounded_by_lease) = self.deadline(received);
        let result = match tokio::time::timeout_at(deadline, self.execute(&job, &claimed, received)).await {
            Ok(result) => result,
            Err(_) if bounded_by_lease => Err(PipelineError::LeaseLost),
            Err(_) => Err(PipelineError::Timeout(self.settings.per_message_timeout)),
        };

        match result {
            Ok(result_key) => {
                tracing::info!(
                    job_id = %job.job_id,
                    attempt = claimed.attempt,
                    result_key = %result_key,
                    "Job completed successfully"
                );
                self.settle(received).await;
                MessageOutcome::Succeeded {
                    job_id: job.job_id,
                    result_key,
                }
            }
            Err(reason) if reason.is_abandonment() => {
                tracing::warn!(job_id = %job.job_id, reason = %reason, "Abandoning in-flight work");
                MessageOutcome::Abandoned {
                    job_id: job.job_id,
                    reason,
                }
            }
            Err(error) => {
                tracing::error!(
                    job_id = %job.job_id,
                    attempt = claimed.attempt,
                    kind = error.kind(),
                    error = %error,
                    "Job processing failed"
                );
                self.record_failure(&claimed, &error, received).await;
                self.release(received).await;
                MessageOutcome::Failed {
                    job_id: Some(job.job_id),
                    error,
                }
            }
        }
    }

    /// Move the META record to `PROCESSING` with a compare-and-swap against
    /// the revision just read.
    async fn claim(&self, job: &JobKey, received: &ReceivedMessage) -> Result<Claim, PipelineError> {
        let now = Utc::now();
        let current = match self.state.get(&job.partition_key(), META_SORT_KEY).await {
            Ok(record) => Some(record),
            Err(StateError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        let (next, condition) = match current {
            // Notification never created the record; the first claim does.
            None => (
                JobRecord::pending(job, now, self.settings.record_ttl).claimed(now),
                Condition::NotExists,
            ),
            Some(record) => match record.status {
                JobStatus::Succeeded => return Ok(Claim::AlreadySucceeded),
                // Only a redelivery of the failing message retries a FAILED job.
                JobStatus::Failed if !failed_by(&record, &received.message_id) => {
                    return Ok(Claim::Superseded)
                }
                _ => (record.claimed(now), Condition::unchanged(&record)),
            },
        };

        self.state.put(&next, Some(condition)).await?;
        self.record_snapshot(&next).await;
        tracing::info!(job_id = %job.job_id, attempt = next.attempt, "Job claimed");
        Ok(Claim::Claimed(next))
    }

    async fn execute(
        &self,
        job: &JobKey,
        claimed: &JobRecord,
        received: &ReceivedMessage,
    ) -> Result<String, PipelineError> {
        let source = self.objects.get(&job.object_key).await?;
        if source.len() as u64 > self.settings.scratch_limit_bytes {
            return Err(PipelineError::CallbackFailure(format!(
                "source is {} bytes, scratch space holds {}",
                source.len(),
                self.settings.scratch_limit_bytes
            )));
        }

        let analyzer = Arc::clone(&self.analyzer);
        let started = std::time::Instant::now();
        let output = tokio::task::spawn_blocking(move || analyzer.analyze(&source))
            .await
            .map_err(|e| PipelineError::CallbackFailure(format!("analysis task aborted: {}", e)))??;
        metrics::histogram!("pipeline_processing_seconds").record(started.elapsed().as_secs_f64());

        // The result key depends only on the job, so a repeated run overwrites it.
        let result_key = self.settings.layout.result_key_for(&job.job_id);
        self.objects.put(&result_key, &output, RESULT_CONTENT_TYPE).await?;

        self.ensure_lease(received)?;
        let done = claimed.succeeded(&result_key, Utc::now(), self.settings.record_ttl);
        self.state.put(&done, Some(Condition::unchanged(claimed))).await?;
        self.record_snapshot(&done).await;
        metrics::counter!("pipeline_jobs_succeeded_total").increment(1);
        Ok(result_key)
    }

    /// Best-effort `FAILED` write. The message's fate does not depend on it.
    async fn record_failure(&self, claimed: &JobRecord, error: &PipelineError, received: &ReceivedMessage) {
        metrics::counter!("pipeline_jobs_failed_total", "kind" => error.kind()).increment(1);
        if self.ensure_lease(received).is_err() {
            tracing::warn!("Lease lost, skipping failure record");
            return;
        }

        let delivery_count = received.delivery_count();
        let info = ErrorInfo {
            kind: error.kind().to_string(),
            message: error.to_string(),
            delivery_count,
            message_id: Some(received.message_id.clone()),
            is_final: delivery_count >= self.settings.max_receive_count,
        };
        let failed = claimed.failed(info, Utc::now(), self.settings.record_ttl);
        match self.state.put(&failed, Some(Condition::unchanged(claimed))).await {
            Ok(()) => self.record_snapshot(&failed).await,
            Err(e) => tracing::warn!(error = %e, "Failed to record job failure"),
        }
    }

    async fn record_snapshot(&self, record: &JobRecord) {
        if let Err(e) = self.state.put(&record.event_snapshot(), None).await {
            tracing::debug!(error = %e, sort_key = %record.sort_key, "Failed to write transition snapshot");
        }
    }

    fn ensure_lease(&self, received: &ReceivedMessage) -> Result<(), PipelineError> {
        if Instant::now() + self.settings.lease_margin >= received.leased_until {
            return Err(PipelineError::LeaseLost);
        }
        Ok(())
    }

    /// The earlier of the per-message timeout and the lease end (less the
    /// safety margin), and whether the lease is the binding one.
    fn deadline(&self, received: &ReceivedMessage) -> (Instant, bool) {
        let lease_end = received
            .leased_until
            .checked_sub(self.settings.lease_margin)
            .unwrap_or(received.leased_until);
        let timeout_end = Instant::now() + self.settings.per_message_timeout;
        if lease_end <= timeout_end {
            (lease_end, true)
        } else {
            (timeout_end, false)
        }
    }

    async fn settle(&self, received: &ReceivedMessage) {
        if let Err(e) = self.queue.ack(&received.receipt).await {
            // The job is committed; a redelivery will be acknowledged as a duplicate.
            tracing::warn!(error = %e, "Failed to acknowledge message");
        }
    }

    async fn release(&self, received: &ReceivedMessage) {
        if let Err(e) = self.queue.nack(&received.receipt).await {
            tracing::warn!(error = %e, "Failed to release message; it returns when its lease expires");
        }
    }
}

fn failed_by(record: &JobRecord, message_id: &str) -> bool {
    record
        .error_info
        .as_ref()
        .and_then(|info| info.message_id.as_deref())
        == Some(message_id)
}
