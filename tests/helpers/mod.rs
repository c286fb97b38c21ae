//! Shared fixtures for the pipeline and API tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use video_ingest::{
    app_state::{ApiSettings, AppState},
    models::{
        event::ObjectCreatedEvent,
        job::{partition_key_for, JobRecord, KeyLayout, META_SORT_KEY},
    },
    services::{
        analyzer::{AnalysisError, Analyzer},
        memory::{MemoryObjectStore, MemoryQueue, MemoryStateStore},
        notifier::{IngestionNotifier, NotifyOutcome},
        queue::{Queue, QueueSettings},
        retry::RetryPolicy,
        state::StateStore,
        storage::ObjectStore,
        worker::{Worker, WorkerSettings},
    },
};

/// One pipeline wired to in-memory backends.
pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub state: Arc<MemoryStateStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub notifier: IngestionNotifier,
    pub layout: KeyLayout,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_queue(QueueSettings::default())
    }

    pub fn with_queue(settings: QueueSettings) -> Self {
        let queue = Arc::new(MemoryQueue::new(settings));
        let state = Arc::new(MemoryStateStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let layout = KeyLayout::default();
        let notifier = IngestionNotifier::new(state.clone(), queue.clone(), layout.clone(), None)
            .with_retry(RetryPolicy::none());
        Self {
            queue,
            state,
            objects,
            notifier,
            layout,
        }
    }

    pub fn worker(&self, analyzer: impl Analyzer) -> Worker {
        self.worker_with(analyzer, test_settings())
    }

    pub fn worker_with(&self, analyzer: impl Analyzer, settings: WorkerSettings) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.state.clone(),
            self.objects.clone(),
            Arc::new(analyzer),
            settings,
        )
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.state.clone(),
            self.queue.clone(),
            self.objects.clone(),
            ApiSettings {
                record_ttl: None,
                ..ApiSettings::default()
            },
        )
    }

    /// Store an upload under the ingestion prefix and return its key.
    pub async fn upload(&self, job_id: &str, data: &[u8]) -> String {
        let key = self.layout.object_key_for(job_id);
        self.objects
            .put(&key, data, "application/zip")
            .await
            .expect("upload");
        key
    }

    pub async fn notify(&self, object_key: &str) -> NotifyOutcome {
        self.notifier
            .notify(&ObjectCreatedEvent {
                object_key: object_key.to_string(),
                event_time: Utc::now(),
            })
            .await
            .expect("notify")
    }

    pub async fn meta(&self, job_id: &str) -> JobRecord {
        self.state
            .get(&partition_key_for(job_id), META_SORT_KEY)
            .await
            .expect("job record")
    }

    pub async fn result_bytes(&self, job_id: &str) -> Vec<u8> {
        self.objects
            .get(&self.layout.result_key_for(job_id))
            .await
            .expect("result object")
    }

    pub async fn available(&self) -> u64 {
        self.queue.depth().await.expect("depth").available
    }
}

/// Short leases, no long-poll wait.
pub fn test_settings() -> WorkerSettings {
    WorkerSettings {
        visibility_timeout: Duration::from_secs(5),
        wait_time: Duration::ZERO,
        per_message_timeout: Duration::from_secs(5),
        lease_margin: Duration::from_millis(50),
        record_ttl: None,
        ..WorkerSettings::default()
    }
}

/// Deterministic analysis: a JSON summary of the input.
pub fn summarize(input: &[u8]) -> Result<Vec<u8>, AnalysisError> {
    let checksum = input.iter().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u64));
    let doc = serde_json::json!({ "bytes": input.len(), "checksum": checksum });
    Ok(serde_json::to_vec(&doc).expect("json"))
}

pub fn always_fail(_input: &[u8]) -> Result<Vec<u8>, AnalysisError> {
    Err(AnalysisError::Failed("no pose detected".into()))
}

/// Wraps [`summarize`], counting calls and optionally stalling first.
#[derive(Clone, Default)]
pub struct CountingAnalyzer {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl CountingAnalyzer {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Analyzer for CountingAnalyzer {
    fn analyze(&self, input: &[u8]) -> Result<Vec<u8>, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        summarize(input)
    }
}
