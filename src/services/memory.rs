//! In-process backends for the queue, the state store and the object store.
//!
//! They implement the same contracts as the Redis, PostgreSQL and S3
//! backends and are what the pipeline tests run against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::job::JobRecord;
use crate::models::message::{DeadLetter, QueueDepth, QueueMessage, ReceiptHandle, ReceivedMessage};
use crate::services::queue::{Queue, QueueError, QueueSettings};
use crate::services::state::{Condition, StateError, StateStore};
use crate::services::storage::{ObjectStore, StorageError};

struct Entry {
    message: QueueMessage,
    leased_until: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    available: VecDeque<String>,
    entries: HashMap<String, Entry>,
    dead: Vec<(String, DateTime<Utc>)>,
}

impl QueueState {
    fn reclaim_expired(&mut self, now: Instant, max_receive: u32) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.leased_until.is_some_and(|until| until <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.release(&id, max_receive);
        }
    }

    fn release(&mut self, id: &str, max_receive: u32) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.leased_until = None;
        if entry.message.delivery_count >= max_receive {
            self.dead.push((id.to_string(), Utc::now()));
        } else {
            self.available.push_back(id.to_string());
        }
    }

    /// The entry id if `receipt` still names its current, unexpired lease.
    fn leased(&self, receipt: &ReceiptHandle, now: Instant) -> Option<String> {
        let entry = self.entries.get(receipt.message_id())?;
        let live = entry.leased_until.is_some_and(|until| until > now);
        (live && entry.message.delivery_count == receipt.delivery_count())
            .then(|| receipt.message_id().to_string())
    }

    fn dead_letter(&self, id: &str, at: DateTime<Utc>) -> Option<DeadLetter> {
        self.entries.get(id).map(|e| DeadLetter {
            message_id: id.to_string(),
            message: e.message.clone(),
            dead_lettered_at: at,
        })
    }
}

/// In-memory queue with the same lease and dead-letter semantics as
/// [`RedisQueue`](crate::services::queue::RedisQueue).
pub struct MemoryQueue {
    settings: QueueSettings,
    state: Mutex<QueueState>,
    arrivals: Notify,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self, max: usize, visibility: Duration) -> Vec<ReceivedMessage> {
        let now = Instant::now();
        let mut state = self.lock();
        state.reclaim_expired(now, self.settings.max_receive_count);

        let mut out = Vec::new();
        while out.len() < max {
            let Some(id) = state.available.pop_front() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            entry.message.delivery_count += 1;
            entry.leased_until = Some(now + visibility);
            out.push(ReceivedMessage {
                receipt: ReceiptHandle::new(&id, entry.message.delivery_count),
                message_id: id,
                message: entry.message.clone(),
                leased_until: now + visibility,
            });
        }
        out
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        {
            let mut state = self.lock();
            state.entries.insert(
                id.clone(),
                Entry {
                    message: QueueMessage {
                        delivery_count: 0,
                        ..message.clone()
                    },
                    leased_until: None,
                },
            );
            state.available.push_back(id.clone());
        }
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        max: usize,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let arrival = self.arrivals.notified();
            let batch = self.take(max, visibility);
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            // Leases expire without a notification, so wake periodically too.
            let step = deadline.min(Instant::now() + Duration::from_millis(25));
            let _ = tokio::time::timeout_at(step, arrival).await;
        }
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.reclaim_expired(Instant::now(), self.settings.max_receive_count);
        let id = state
            .leased(receipt, Instant::now())
            .ok_or_else(|| QueueError::LeaseLost(receipt.to_string()))?;
        state.entries.remove(&id);
        Ok(())
    }

    async fn nack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            state.reclaim_expired(Instant::now(), self.settings.max_receive_count);
            let id = state
                .leased(receipt, Instant::now())
                .ok_or_else(|| QueueError::LeaseLost(receipt.to_string()))?;
            state.release(&id, self.settings.max_receive_count);
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letters(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let mut state = self.lock();
        state.reclaim_expired(Instant::now(), self.settings.max_receive_count);
        Ok(state
            .dead
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|(id, at)| state.dead_letter(id, *at))
            .collect())
    }

    async fn dead_letter(&self, message_id: &str) -> Result<Option<DeadLetter>, QueueError> {
        let state = self.lock();
        Ok(state
            .dead
            .iter()
            .find(|(id, _)| id == message_id)
            .and_then(|(id, at)| state.dead_letter(id, *at)))
    }

    async fn redrive(&self, message_id: &str) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            let position = state
                .dead
                .iter()
                .position(|(id, _)| id == message_id)
                .ok_or_else(|| QueueError::NotFound(message_id.to_string()))?;
            state.dead.remove(position);
            if let Some(entry) = state.entries.get_mut(message_id) {
                entry.message.delivery_count = 0;
            }
            state.available.push_back(message_id.to_string());
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn prune_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let (pruned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.dead)
            .into_iter()
            .partition(|(_, at)| *at < cutoff);
        state.dead = kept;
        for (id, _) in &pruned {
            state.entries.remove(id);
        }
        Ok(pruned.len() as u64)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut state = self.lock();
        state.reclaim_expired(Instant::now(), self.settings.max_receive_count);
        let in_flight = state
            .entries
            .values()
            .filter(|e| e.leased_until.is_some())
            .count();
        Ok(QueueDepth {
            available: state.available.len() as u64,
            in_flight: in_flight as u64,
            dead_lettered: state.dead.len() as u64,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// In-memory state store. Conditions are evaluated under a single lock.
#[derive(Default)]
pub struct MemoryStateStore {
    items: Mutex<BTreeMap<(String, String), JobRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), JobRecord>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of physically stored items, expired ones included.
    pub fn stored_len(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, record: &JobRecord, condition: Option<Condition>) -> Result<(), StateError> {
        let key = (record.partition_key.clone(), record.sort_key.clone());
        let now = Utc::now();
        let mut items = self.lock();
        if let Some(condition) = condition {
            let current = items.get(&key).filter(|r| !r.is_expired(now));
            if !condition.holds(current) {
                return Err(StateError::ConditionFailed);
            }
        }
        items.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, partition_key: &str, sort_key: &str) -> Result<JobRecord, StateError> {
        let now = Utc::now();
        self.lock()
            .get(&(partition_key.to_string(), sort_key.to_string()))
            .filter(|r| !r.is_expired(now))
            .cloned()
            .ok_or(StateError::NotFound)
    }

    async fn query(
        &self,
        partition_key: &str,
        sort_key_prefix: Option<&str>,
    ) -> Result<Vec<JobRecord>, StateError> {
        let now = Utc::now();
        let prefix = sort_key_prefix.unwrap_or("");
        Ok(self
            .lock()
            .range((partition_key.to_string(), String::new())..)
            .take_while(|((pk, _), _)| pk == partition_key)
            .filter(|((_, sk), r)| sk.starts_with(prefix) && !r.is_expired(now))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<u64, StateError> {
        let now = Utc::now();
        let mut items = self.lock();
        let before = items.len();
        items.retain(|_, r| !r.is_expired(now));
        Ok((before - items.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), StateError> {
        Ok(())
    }
}

/// In-memory object store. Pre-signed URLs use a `memory://` scheme.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, String)>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.lock().get(key).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.lock()
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock().contains_key(key))
    }

    async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        Ok(format!("memory://{}?method=PUT&expires={}", key, expires_in.as_secs()))
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        Ok(format!("memory://{}?method=GET&expires={}", key, expires_in.as_secs()))
    }
}
