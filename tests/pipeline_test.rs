mod helpers;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use helpers::{always_fail, summarize, test_settings, CountingAnalyzer, Harness};
use video_ingest::{
    error::PipelineError,
    models::{
        job::{JobRecord, JobStatus, EVENT_SORT_PREFIX},
        message::{DeadLetter, QueueDepth, QueueMessage, ReceiptHandle, ReceivedMessage},
    },
    services::{
        admin::JobAdmin,
        memory::MemoryQueue,
        notifier::NotifyOutcome,
        queue::{Queue, QueueError, QueueSettings},
        reconcile::{Reconciler, DEAD_LETTERED_KIND},
        state::{Condition, StateError, StateStore},
        storage::ObjectStore,
        worker::{MessageOutcome, Worker, WorkerSettings},
    },
};

/// Forwards to a [`MemoryQueue`] but silently drops the first ack.
struct LosesFirstAck {
    inner: Arc<MemoryQueue>,
    dropped: AtomicBool,
}

#[async_trait]
impl Queue for LosesFirstAck {
    async fn enqueue(&self, message: &QueueMessage) -> Result<String, QueueError> {
        self.inner.enqueue(message).await
    }

    async fn receive(
        &self,
        max: usize,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.inner.receive(max, visibility, wait).await
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        if !self.dropped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ack(receipt).await
    }

    async fn nack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.inner.nack(receipt).await
    }

    async fn dead_letters(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.inner.dead_letters(offset, limit).await
    }

    async fn dead_letter(&self, message_id: &str) -> Result<Option<DeadLetter>, QueueError> {
        self.inner.dead_letter(message_id).await
    }

    async fn redrive(&self, message_id: &str) -> Result<(), QueueError> {
        self.inner.redrive(message_id).await
    }

    async fn prune_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        self.inner.prune_dead_letters(cutoff).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        self.inner.depth().await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

fn succeeded_count(outcomes: &[MessageOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, MessageOutcome::Succeeded { .. }))
        .count()
}

#[tokio::test]
async fn test_upload_event_to_succeeded_result() {
    let h = Harness::new();
    let key = h.upload("video1", b"PK\x03\x04 frames").await;
    assert_eq!(key, "raw/video1.zip");

    match h.notify(&key).await {
        NotifyOutcome::Enqueued { job_id, duplicate, .. } => {
            assert_eq!(job_id, "video1");
            assert!(!duplicate);
        }
        other => panic!("expected enqueue, got {:?}", other),
    }
    assert_eq!(h.meta("video1").await.status, JobStatus::Pending);
    assert_eq!(h.available().await, 1);

    let worker = h.worker(summarize);
    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.item_failures().is_empty());
    match &report.outcomes[0].1 {
        MessageOutcome::Succeeded { job_id, result_key } => {
            assert_eq!(job_id, "video1");
            assert_eq!(result_key, "results/video1/output.json");
        }
        other => panic!("expected success, got {:?}", other),
    }

    let record = h.meta("video1").await;
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.attempt, 1);
    assert_eq!(record.result_key.as_deref(), Some("results/video1/output.json"));
    assert!(record.error_info.is_none());

    assert_eq!(h.result_bytes("video1").await, summarize(b"PK\x03\x04 frames").unwrap());
    assert_eq!(
        h.objects.content_type("results/video1/output.json").as_deref(),
        Some("application/json")
    );
    assert_eq!(h.queue.depth().await.unwrap(), QueueDepth::default());

    let history: Vec<String> = h
        .state
        .query("video#video1", Some(EVENT_SORT_PREFIX))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.sort_key)
        .collect();
    assert_eq!(
        history,
        vec!["EVENT#0000#PENDING", "EVENT#0001#PROCESSING", "EVENT#0001#SUCCEEDED"]
    );
}

#[tokio::test]
async fn test_callback_failing_every_delivery_lands_in_dlq() {
    let h = Harness::new();
    let key = h.upload("video2", b"corrupt").await;
    h.notify(&key).await;
    let worker = h.worker(always_fail);

    for delivery in 1..=3u32 {
        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.outcomes.len(), 1, "delivery {}", delivery);
        assert!(matches!(
            &report.outcomes[0].1,
            MessageOutcome::Failed {
                error: PipelineError::CallbackFailure(_),
                ..
            }
        ));

        let record = h.meta("video2").await;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempt, delivery);
        assert!(record.result_key.is_none());
        let info = record.error_info.unwrap();
        assert_eq!(info.kind, "callback_failure");
        assert_eq!(info.delivery_count, delivery);
        assert_eq!(info.is_final, delivery == 3);
    }

    let depth = h.queue.depth().await.unwrap();
    assert_eq!(depth.available, 0);
    assert_eq!(depth.in_flight, 0);
    assert_eq!(depth.dead_lettered, 1);

    let dead = h.queue.dead_letters(0, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.object_key, "raw/video2.zip");
    assert_eq!(dead[0].message.delivery_count, 3);

    assert!(worker.poll_once().await.unwrap().outcomes.is_empty());
    assert!(!h.objects.exists("results/video2/output.json").await.unwrap());
}

#[tokio::test]
async fn test_redelivered_duplicate_cannot_reopen_failed_job() {
    let h = Harness::new();
    let key = h.upload("clip", b"corrupt").await;
    h.notify(&key).await;
    let failing = h.worker(always_fail);
    for _ in 0..3 {
        failing.poll_once().await.unwrap();
    }
    assert_eq!(h.queue.depth().await.unwrap().dead_lettered, 1);

    // A duplicate notification whose first delivery died with its worker.
    h.notify(&key).await;
    let lost = h
        .queue
        .receive(1, Duration::from_millis(50), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(lost.len(), 1);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let report = h.worker(summarize).poll_once().await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].0, lost[0].message_id);
    assert!(matches!(report.outcomes[0].1, MessageOutcome::Superseded { .. }));

    let record = h.meta("clip").await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempt, 3);
    assert!(!h.objects.exists("results/clip/output.json").await.unwrap());
    assert_eq!(h.available().await, 0);
}

#[tokio::test]
async fn test_lost_ack_redelivery_keeps_result() {
    let h = Harness::new();
    let queue = Arc::new(LosesFirstAck {
        inner: h.queue.clone(),
        dropped: AtomicBool::new(false),
    });
    let analyzer = CountingAnalyzer::default();
    let worker = Worker::new(
        queue,
        h.state.clone(),
        h.objects.clone(),
        Arc::new(analyzer.clone()),
        WorkerSettings {
            visibility_timeout: Duration::from_millis(300),
            ..test_settings()
        },
    );

    let key = h.upload("clip", b"same input").await;
    h.notify(&key).await;

    let first = worker.poll_once().await.unwrap();
    assert!(matches!(first.outcomes[0].1, MessageOutcome::Succeeded { .. }));
    let committed = h.result_bytes("clip").await;
    assert_eq!(h.queue.depth().await.unwrap().in_flight, 1);

    tokio::time::sleep(Duration::from_millis(350)).await;
    let second = worker.poll_once().await.unwrap();
    assert!(matches!(
        second.outcomes[0].1,
        MessageOutcome::AlreadySucceeded { .. }
    ));

    assert_eq!(analyzer.calls(), 1);
    assert_eq!(h.result_bytes("clip").await, committed);
    assert_eq!(h.meta("clip").await.attempt, 1);
    assert_eq!(h.queue.depth().await.unwrap(), QueueDepth::default());
}

#[tokio::test]
async fn test_rerunning_pipeline_is_byte_identical() {
    async fn run(input: &[u8]) -> Vec<u8> {
        let h = Harness::new();
        let key = h.upload("rerun", input).await;
        h.notify(&key).await;
        h.worker(summarize).poll_once().await.unwrap();
        h.result_bytes("rerun").await
    }

    let input = b"deterministic video payload";
    assert_eq!(run(input).await, run(input).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exactly_one_simultaneous_claim_wins() {
    let h = Harness::new();
    let job = h.layout.job_for_object("raw/race.zip").unwrap();
    let now = Utc::now();
    let pending = JobRecord::pending(&job, now, None);
    h.state.put(&pending, Some(Condition::NotExists)).await.unwrap();

    let claim = pending.claimed(now);
    let (a, b) = tokio::join!(
        h.state.put(&claim, Some(Condition::unchanged(&pending))),
        h.state.put(&claim, Some(Condition::unchanged(&pending))),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    assert!(matches!(a.err().or(b.err()), Some(StateError::ConditionFailed)));
    assert_eq!(h.meta("race").await.attempt, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_workers_commit_once() {
    let h = Harness::new();
    let key = h.upload("contended", b"payload").await;
    h.notify(&key).await;
    h.notify(&key).await;

    let analyzer = CountingAnalyzer::slow(Duration::from_millis(50));
    let a = h.worker(analyzer.clone());
    let b = h.worker(analyzer.clone());
    let (ra, rb) = tokio::join!(a.poll_once(), b.poll_once());

    let outcomes: Vec<MessageOutcome> = ra
        .unwrap()
        .outcomes
        .into_iter()
        .chain(rb.unwrap().outcomes)
        .map(|(_, o)| o)
        .collect();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(succeeded_count(&outcomes), 1);

    let record = h.meta("contended").await;
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(h.result_bytes("contended").await, summarize(b"payload").unwrap());
}

#[tokio::test]
async fn test_succeeded_record_always_has_result_object() {
    let h = Harness::new();
    for id in ["a", "b", "c"] {
        let key = h.upload(id, id.as_bytes()).await;
        h.notify(&key).await;
    }
    let missing = h.layout.object_key_for("d");
    h.notify(&missing).await;

    let worker = h.worker_with(
        summarize,
        WorkerSettings {
            batch_size: 4,
            ..test_settings()
        },
    );
    worker.poll_once().await.unwrap();

    for id in ["a", "b", "c", "d"] {
        let record = h.meta(id).await;
        match record.status {
            JobStatus::Succeeded => {
                let key = record.result_key.expect("result key on SUCCEEDED");
                assert!(h.objects.exists(&key).await.unwrap());
            }
            _ => assert!(record.result_key.is_none()),
        }
    }
}

#[tokio::test]
async fn test_duplicate_notifications_processed_once() {
    let h = Harness::new();
    let key = h.upload("dup", b"bytes").await;
    h.notify(&key).await;
    assert!(matches!(
        h.notify(&key).await,
        NotifyOutcome::Enqueued { duplicate: true, .. }
    ));
    assert_eq!(h.available().await, 2);

    let analyzer = CountingAnalyzer::default();
    let worker = h.worker(analyzer.clone());
    let first = worker.poll_once().await.unwrap();
    let second = worker.poll_once().await.unwrap();

    assert!(matches!(first.outcomes[0].1, MessageOutcome::Succeeded { .. }));
    assert!(matches!(second.outcomes[0].1, MessageOutcome::AlreadySucceeded { .. }));
    assert_eq!(analyzer.calls(), 1);
    assert_eq!(h.queue.depth().await.unwrap(), QueueDepth::default());
}

#[tokio::test]
async fn test_events_outside_layout_are_skipped() {
    let h = Harness::new();
    assert_eq!(h.notify("raw/notes.txt").await, NotifyOutcome::Skipped);
    assert_eq!(h.notify("results/video1/output.json").await, NotifyOutcome::Skipped);
    assert_eq!(h.available().await, 0);
    assert_eq!(h.state.stored_len(), 0);
}

#[tokio::test]
async fn test_partial_batch_failure() {
    let h = Harness::new();
    let good = h.upload("good", b"ok").await;
    h.notify(&good).await;
    h.notify(&h.layout.object_key_for("missing")).await;

    let worker = h.worker_with(
        summarize,
        WorkerSettings {
            batch_size: 2,
            ..test_settings()
        },
    );
    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.item_failures().len(), 1);

    assert_eq!(h.meta("good").await.status, JobStatus::Succeeded);
    let missing = h.meta("missing").await;
    assert_eq!(missing.status, JobStatus::Failed);
    assert_eq!(missing.error_info.unwrap().kind, "poison_message");
    assert_eq!(h.available().await, 1);
}

#[tokio::test]
async fn test_unroutable_message_is_dead_lettered() {
    let h = Harness::new();
    h.queue
        .enqueue(&QueueMessage {
            object_key: "uploads/notes.txt".into(),
            job_partition_key: None,
            enqueue_time: Utc::now(),
            delivery_count: 0,
        })
        .await
        .unwrap();

    let worker = h.worker(summarize);
    for _ in 0..3 {
        let report = worker.poll_once().await.unwrap();
        assert!(matches!(
            &report.outcomes[0].1,
            MessageOutcome::Failed {
                job_id: None,
                error: PipelineError::PoisonMessage(_),
            }
        ));
    }
    assert_eq!(h.queue.depth().await.unwrap().dead_lettered, 1);
    assert_eq!(h.state.stored_len(), 0);
}

#[tokio::test]
async fn test_lease_loss_abandons_without_commit() {
    let h = Harness::new();
    let key = h.upload("slow", b"long video").await;
    h.notify(&key).await;

    let stalled = h.worker_with(
        CountingAnalyzer::slow(Duration::from_millis(600)),
        WorkerSettings {
            visibility_timeout: Duration::from_millis(300),
            ..test_settings()
        },
    );
    let report = stalled.poll_once().await.unwrap();
    assert!(matches!(
        report.outcomes[0].1,
        MessageOutcome::Abandoned {
            reason: PipelineError::LeaseLost,
            ..
        }
    ));
    let record = h.meta("slow").await;
    assert_eq!(record.status, JobStatus::Processing);
    assert_eq!(record.attempt, 1);
    assert!(!h.objects.exists("results/slow/output.json").await.unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = h.worker(summarize).poll_once().await.unwrap();
    assert!(matches!(report.outcomes[0].1, MessageOutcome::Succeeded { .. }));
    let record = h.meta("slow").await;
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.attempt, 2);
}

#[tokio::test]
async fn test_per_message_timeout_records_failure() {
    let h = Harness::new();
    let key = h.upload("stuck", b"x").await;
    h.notify(&key).await;

    let worker = h.worker_with(
        CountingAnalyzer::slow(Duration::from_millis(400)),
        WorkerSettings {
            per_message_timeout: Duration::from_millis(100),
            ..test_settings()
        },
    );
    let report = worker.poll_once().await.unwrap();
    assert!(matches!(
        report.outcomes[0].1,
        MessageOutcome::Failed {
            error: PipelineError::Timeout(_),
            ..
        }
    ));
    let record = h.meta("stuck").await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error_info.unwrap().kind, "timeout");
    assert_eq!(h.available().await, 1);
}

#[tokio::test]
async fn test_source_larger_than_scratch_fails() {
    let h = Harness::new();
    let key = h.upload("huge", &[0u8; 64]).await;
    h.notify(&key).await;

    let analyzer = CountingAnalyzer::default();
    let worker = h.worker_with(
        analyzer.clone(),
        WorkerSettings {
            scratch_limit_bytes: 16,
            ..test_settings()
        },
    );
    let report = worker.poll_once().await.unwrap();
    assert!(matches!(
        report.outcomes[0].1,
        MessageOutcome::Failed {
            error: PipelineError::CallbackFailure(_),
            ..
        }
    ));
    assert_eq!(analyzer.calls(), 0);
}

#[tokio::test]
async fn test_first_claim_creates_missing_record() {
    let h = Harness::new();
    let key = h.upload("orphan", b"data").await;
    let job = h.layout.job_for_object(&key).unwrap();
    h.queue.enqueue(&QueueMessage::new(&job)).await.unwrap();

    let report = h.worker(summarize).poll_once().await.unwrap();
    assert!(matches!(report.outcomes[0].1, MessageOutcome::Succeeded { .. }));
    let record = h.meta("orphan").await;
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.attempt, 1);
}

#[tokio::test]
async fn test_sweep_fails_jobs_stranded_by_dead_letter() {
    let h = Harness::with_queue(QueueSettings {
        max_receive_count: 1,
        ..QueueSettings::default()
    });
    let key = h.upload("crashed", b"data").await;
    h.notify(&key).await;

    // A worker claims the job and dies holding the lease.
    let leased = h
        .queue
        .receive(1, Duration::from_millis(50), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    let pending = h.meta("crashed").await;
    h.state
        .put(&pending.claimed(Utc::now()), Some(Condition::unchanged(&pending)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let reconciler = Reconciler::new(
        h.queue.clone(),
        h.state.clone(),
        h.layout.clone(),
        None,
        QueueSettings::default().retention,
    );
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.dead_letters_checked, 1);
    assert_eq!(report.marked_failed, 1);

    let record = h.meta("crashed").await;
    assert_eq!(record.status, JobStatus::Failed);
    let info = record.error_info.unwrap();
    assert_eq!(info.kind, DEAD_LETTERED_KIND);
    assert!(info.is_final);

    // Idempotent.
    assert_eq!(reconciler.sweep().await.unwrap().marked_failed, 0);
}

#[tokio::test]
async fn test_sweep_reaches_past_first_page_of_dead_letters() {
    let h = Harness::with_queue(QueueSettings {
        max_receive_count: 1,
        ..QueueSettings::default()
    });
    for i in 0..100 {
        h.notify(&h.layout.object_key_for(&format!("bad{}", i))).await;
    }
    let failing = h.worker_with(
        always_fail,
        WorkerSettings {
            batch_size: 25,
            ..test_settings()
        },
    );
    while !failing.poll_once().await.unwrap().outcomes.is_empty() {}
    assert_eq!(h.queue.depth().await.unwrap().dead_lettered, 100);

    let key = h.upload("late", b"data").await;
    h.notify(&key).await;
    let leased = h
        .queue
        .receive(1, Duration::from_millis(50), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    let pending = h.meta("late").await;
    h.state
        .put(&pending.claimed(Utc::now()), Some(Condition::unchanged(&pending)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let reconciler = Reconciler::new(
        h.queue.clone(),
        h.state.clone(),
        h.layout.clone(),
        None,
        QueueSettings::default().retention,
    );
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.dead_letters_checked, 101);
    assert_eq!(report.marked_failed, 1);
    assert_eq!(h.meta("late").await.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_sweep_prunes_expired_dead_letters() {
    let h = Harness::with_queue(QueueSettings {
        max_receive_count: 1,
        ..QueueSettings::default()
    });
    h.notify(&h.layout.object_key_for("old")).await;
    h.worker(always_fail).poll_once().await.unwrap();
    assert_eq!(h.queue.depth().await.unwrap().dead_lettered, 1);

    let reconciler = Reconciler::new(
        h.queue.clone(),
        h.state.clone(),
        h.layout.clone(),
        None,
        Duration::ZERO,
    );
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.dead_letters_pruned, 1);
    assert_eq!(h.queue.depth().await.unwrap().dead_lettered, 0);
}

#[tokio::test]
async fn test_redrive_after_fix_succeeds() {
    let h = Harness::new();
    let key = h.upload("flaky", b"payload").await;
    h.notify(&key).await;

    let broken = h.worker(always_fail);
    for _ in 0..3 {
        broken.poll_once().await.unwrap();
    }
    let dead = h.queue.dead_letters(0, 1).await.unwrap();
    assert_eq!(dead.len(), 1);

    let admin = JobAdmin::new(h.state.clone(), h.queue.clone(), h.layout.clone(), None);
    let replay = admin.replay_dead_letter(&dead[0].message_id).await.unwrap();
    assert_eq!(replay.job_id.as_deref(), Some("flaky"));
    let reset = h.meta("flaky").await;
    assert_eq!(reset.status, JobStatus::Pending);
    assert_eq!(reset.attempt, 4);

    // The sweep leaves the reset record alone.
    let reconciler = Reconciler::new(
        h.queue.clone(),
        h.state.clone(),
        h.layout.clone(),
        None,
        QueueSettings::default().retention,
    );
    assert_eq!(reconciler.sweep().await.unwrap().marked_failed, 0);

    let report = h.worker(summarize).poll_once().await.unwrap();
    assert!(matches!(report.outcomes[0].1, MessageOutcome::Succeeded { .. }));
    let record = h.meta("flaky").await;
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.attempt, 5);
    assert_eq!(h.queue.depth().await.unwrap(), QueueDepth::default());
}

#[tokio::test]
async fn test_reprocess_failed_job_runs_again() {
    let h = Harness::with_queue(QueueSettings {
        max_receive_count: 1,
        ..QueueSettings::default()
    });
    let key = h.upload("retry-me", b"payload").await;
    h.notify(&key).await;
    h.worker(always_fail).poll_once().await.unwrap();
    assert_eq!(h.meta("retry-me").await.status, JobStatus::Failed);

    let admin = JobAdmin::new(h.state.clone(), h.queue.clone(), h.layout.clone(), None);
    let response = admin.reprocess("retry-me").await.unwrap();
    assert_eq!(response.attempt, 2);

    let report = h.worker(summarize).poll_once().await.unwrap();
    assert!(matches!(report.outcomes[0].1, MessageOutcome::Succeeded { .. }));
    assert_eq!(h.meta("retry-me").await.attempt, 3);
    // The old message stays dead-lettered for the operator.
    assert_eq!(h.queue.depth().await.unwrap().dead_lettered, 1);
}

#[tokio::test]
async fn test_worker_stops_on_shutdown() {
    let h = Harness::new();
    let worker = h.worker(summarize);
    let (tx, rx) = tokio::sync::watch::channel(false);

    let key = h.upload("loop", b"data").await;
    h.notify(&key).await;

    let handle = tokio::spawn(async move { worker.run(rx).await });
    for _ in 0..100 {
        if h.meta("loop").await.status == JobStatus::Succeeded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.meta("loop").await.status, JobStatus::Succeeded);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}
