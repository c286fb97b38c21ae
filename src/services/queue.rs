use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::models::message::{DeadLetter, QueueDepth, QueueMessage, ReceiptHandle, ReceivedMessage};

const LONG_POLL_STEP: Duration = Duration::from_millis(200);

/// At-least-once message queue with visibility-timeout leases and a
/// dead-letter queue.
///
/// A message whose delivery count has reached the configured maximum is
/// moved to the DLQ when it is nacked or its lease runs out; it is never
/// handed out again until an operator redrives it.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Publish a message and return its id.
    async fn enqueue(&self, message: &QueueMessage) -> Result<String, QueueError>;

    /// Lease up to `max` available messages for `visibility`, waiting up to
    /// `wait` for at least one to arrive.
    async fn receive(
        &self,
        max: usize,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Permanently remove a leased message.
    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Give a leased message back before its lease runs out.
    async fn nack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Dead letters oldest first, skipping the first `offset`.
    async fn dead_letters(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    async fn dead_letter(&self, message_id: &str) -> Result<Option<DeadLetter>, QueueError>;

    /// Move a dead-lettered message back to the main queue with its
    /// delivery count reset.
    async fn redrive(&self, message_id: &str) -> Result<(), QueueError>;

    /// Drop dead letters parked before `cutoff`. Returns how many were dropped.
    async fn prune_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Queue policy shared by every backend.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub max_receive_count: u32,
    /// Dead letters older than this are pruned by the reconciliation sweep.
    pub retention: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "video_ingest".to_string(),
            max_receive_count: 3,
            retention: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

// Shared prologue: reads the server clock into `now` and returns every
// message whose lease ran out to the queue, or to the DLQ when its budget
// is spent.
// KEYS: available, in_flight, bodies, deliveries, dead, dead_at
const RECLAIM_EXPIRED: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local max_receive = tonumber(ARGV[1])
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)) do
  redis.call('ZREM', KEYS[2], id)
  local count = tonumber(redis.call('HGET', KEYS[4], id) or '0')
  if count >= max_receive then
    redis.call('RPUSH', KEYS[5], id)
    redis.call('HSET', KEYS[6], id, now)
  else
    redis.call('LPUSH', KEYS[1], id)
  end
end
"#;

// ARGV: max_receive, batch, lease_ms
const RECEIVE: &str = r#"
local out = {}
local batch = tonumber(ARGV[2])
while #out < batch * 3 do
  local id = redis.call('RPOP', KEYS[1])
  if not id then break end
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    local count = redis.call('HINCRBY', KEYS[4], id, 1)
    redis.call('ZADD', KEYS[2], now + tonumber(ARGV[3]), id)
    table.insert(out, id)
    table.insert(out, tostring(count))
    table.insert(out, body)
  end
end
return out
"#;

const DEPTH: &str = r#"
return { redis.call('LLEN', KEYS[1]), redis.call('ZCARD', KEYS[2]), redis.call('LLEN', KEYS[5]) }
"#;

// Validates that the receipt still names the current, unexpired lease.
// ARGV: max_receive, id, delivery count
const CHECK_LEASE: &str = r#"
local deadline = redis.call('ZSCORE', KEYS[2], ARGV[2])
if not deadline or tonumber(deadline) <= now then return 0 end
if redis.call('HGET', KEYS[4], ARGV[2]) ~= ARGV[3] then return 0 end
redis.call('ZREM', KEYS[2], ARGV[2])
"#;

const ACK: &str = r#"
redis.call('HDEL', KEYS[3], ARGV[2])
redis.call('HDEL', KEYS[4], ARGV[2])
return 1
"#;

const NACK: &str = r#"
if tonumber(ARGV[3]) >= max_receive then
  redis.call('RPUSH', KEYS[5], ARGV[2])
  redis.call('HSET', KEYS[6], ARGV[2], now)
else
  redis.call('LPUSH', KEYS[1], ARGV[2])
end
return 1
"#;

// KEYS: available, dead, deliveries, dead_at ; ARGV: id
const REDRIVE: &str = r#"
if redis.call('LREM', KEYS[2], 0, ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[3], ARGV[1], 0)
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('LPUSH', KEYS[1], ARGV[1])
return 1
"#;

// KEYS: dead, bodies, deliveries, dead_at ; ARGV: id or offset, mode, limit
const DEAD_LETTERS: &str = r#"
local ids
if ARGV[2] == 'one' then
  if not redis.call('LPOS', KEYS[1], ARGV[1]) then return {} end
  ids = { ARGV[1] }
else
  local first = tonumber(ARGV[1])
  ids = redis.call('LRANGE', KEYS[1], first, first + tonumber(ARGV[3]) - 1)
end
local out = {}
for _, id in ipairs(ids) do
  table.insert(out, id)
  table.insert(out, redis.call('HGET', KEYS[3], id) or '0')
  table.insert(out, redis.call('HGET', KEYS[2], id) or '')
  table.insert(out, redis.call('HGET', KEYS[4], id) or '0')
end
return out
"#;

// KEYS: dead, bodies, deliveries, dead_at ; ARGV: cutoff_ms
const PRUNE: &str = r#"
local pruned = 0
for _, id in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  local at = tonumber(redis.call('HGET', KEYS[4], id) or '0')
  if at < tonumber(ARGV[1]) then
    redis.call('LREM', KEYS[1], 0, id)
    redis.call('HDEL', KEYS[2], id)
    redis.call('HDEL', KEYS[3], id)
    redis.call('HDEL', KEYS[4], id)
    pruned = pruned + 1
  end
end
return pruned
"#;

struct QueueKeys {
    available: String,
    in_flight: String,
    bodies: String,
    deliveries: String,
    dead: String,
    dead_at: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        Self {
            available: format!("{}:available", name),
            in_flight: format!("{}:in_flight", name),
            bodies: format!("{}:bodies", name),
            deliveries: format!("{}:deliveries", name),
            dead: format!("{}:dlq", name),
            dead_at: format!("{}:dlq_at", name),
        }
    }
}

struct Scripts {
    receive: redis::Script,
    depth: redis::Script,
    ack: redis::Script,
    nack: redis::Script,
    redrive: redis::Script,
    dead_letters: redis::Script,
    prune: redis::Script,
}

impl Scripts {
    fn load() -> Self {
        let leased = |body: &str| format!("{}{}{}", RECLAIM_EXPIRED, CHECK_LEASE, body);
        Self {
            receive: redis::Script::new(&format!("{}{}", RECLAIM_EXPIRED, RECEIVE)),
            depth: redis::Script::new(&format!("{}{}", RECLAIM_EXPIRED, DEPTH)),
            ack: redis::Script::new(&leased(ACK)),
            nack: redis::Script::new(&leased(NACK)),
            redrive: redis::Script::new(REDRIVE),
            dead_letters: redis::Script::new(DEAD_LETTERS),
            prune: redis::Script::new(PRUNE),
        }
    }
}

/// Redis-backed durable queue.
///
/// Layout: message bodies and delivery counts in hashes, available ids in a
/// list, leases in a sorted set scored by deadline, dead letters in a list.
/// Every state change runs as a Lua script against the Redis clock, so
/// workers on different hosts agree on lease expiry.
pub struct RedisQueue {
    client: redis::Client,
    settings: QueueSettings,
    keys: QueueKeys,
    scripts: Scripts,
}

impl RedisQueue {
    pub fn new(redis_url: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            keys: QueueKeys::new(&settings.name),
            settings,
            scripts: Scripts::load(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    fn lease_keys<'a, 's>(
        &self,
        invocation: &'a mut redis::ScriptInvocation<'s>,
    ) -> &'a mut redis::ScriptInvocation<'s> {
        invocation
            .key(&self.keys.available)
            .key(&self.keys.in_flight)
            .key(&self.keys.bodies)
            .key(&self.keys.deliveries)
            .key(&self.keys.dead)
            .key(&self.keys.dead_at)
            .arg(self.settings.max_receive_count)
    }

    async fn receive_once(
        &self,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let leased_until = Instant::now() + visibility;
        let mut invocation = self.scripts.receive.prepare_invoke();
        let raw: Vec<String> = self
            .lease_keys(&mut invocation)
            .arg(max)
            .arg(visibility.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        let mut received = Vec::with_capacity(raw.len() / 3);
        for chunk in raw.chunks_exact(3) {
            let (id, count, body) = (&chunk[0], &chunk[1], &chunk[2]);
            let delivery_count: u32 = count.parse().unwrap_or(1);
            let receipt = ReceiptHandle::new(id, delivery_count);
            match serde_json::from_str::<QueueMessage>(body) {
                Ok(mut message) => {
                    message.delivery_count = delivery_count;
                    received.push(ReceivedMessage {
                        message_id: id.clone(),
                        receipt,
                        message,
                        leased_until,
                    });
                }
                Err(e) => {
                    // Undecodable bodies burn their delivery budget and end up in the DLQ.
                    tracing::warn!(message_id = %id, error = %e, "Discarding undecodable message delivery");
                    self.nack(&receipt).await?;
                }
            }
        }
        Ok(received)
    }

    async fn settle(&self, script: &redis::Script, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let mut invocation = script.prepare_invoke();
        let settled: i64 = self
            .lease_keys(&mut invocation)
            .arg(receipt.message_id())
            .arg(receipt.delivery_count().to_string())
            .invoke_async(&mut conn)
            .await?;
        if settled == 0 {
            return Err(QueueError::LeaseLost(receipt.to_string()));
        }
        Ok(())
    }

    async fn load_dead_letters(&self, arg: String, mode: &str, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = self
            .scripts
            .dead_letters
            .key(&self.keys.dead)
            .key(&self.keys.bodies)
            .key(&self.keys.deliveries)
            .key(&self.keys.dead_at)
            .arg(arg)
            .arg(mode)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(raw.len() / 4);
        for chunk in raw.chunks_exact(4) {
            let Ok(mut message) = serde_json::from_str::<QueueMessage>(&chunk[2]) else {
                tracing::warn!(message_id = %chunk[0], "Dead letter has an undecodable body");
                continue;
            };
            message.delivery_count = chunk[1].parse().unwrap_or(0);
            let at_ms: i64 = chunk[3].parse().unwrap_or(0);
            entries.push(DeadLetter {
                message_id: chunk[0].clone(),
                message,
                dead_lettered_at: Utc.timestamp_millis_opt(at_ms).single().unwrap_or_default(),
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&QueueMessage {
            delivery_count: 0,
            ..message.clone()
        })
        .map_err(QueueError::Serialize)?;

        redis::pipe()
            .atomic()
            .hset(&self.keys.bodies, &id, &payload)
            .ignore()
            .hset(&self.keys.deliveries, &id, 0)
            .ignore()
            .lpush(&self.keys.available, &id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

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
            let batch = self.receive_once(max, visibility).await?;
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            sleep(LONG_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.settle(&self.scripts.ack, receipt).await
    }

    async fn nack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.settle(&self.scripts.nack, receipt).await
    }

    async fn dead_letters(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // Run the reclaim prologue so expired last deliveries show up.
        self.depth().await?;
        self.load_dead_letters(offset.to_string(), "range", limit).await
    }

    async fn dead_letter(&self, message_id: &str) -> Result<Option<DeadLetter>, QueueError> {
        Ok(self
            .load_dead_letters(message_id.to_string(), "one", 1)
            .await?
            .into_iter()
            .next())
    }

    async fn redrive(&self, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let moved: i64 = self
            .scripts
            .redrive
            .key(&self.keys.available)
            .key(&self.keys.dead)
            .key(&self.keys.deliveries)
            .key(&self.keys.dead_at)
            .arg(message_id)
            .invoke_async(&mut conn)
            .await?;
        if moved == 0 {
            return Err(QueueError::NotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn prune_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let pruned: u64 = self
            .scripts
            .prune
            .key(&self.keys.dead)
            .key(&self.keys.bodies)
            .key(&self.keys.deliveries)
            .key(&self.keys.dead_at)
            .arg(cutoff.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(pruned)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.depth.prepare_invoke();
        let counts: (u64, u64, u64) = self.lease_keys(&mut invocation).invoke_async(&mut conn).await?;
        Ok(QueueDepth {
            available: counts.0,
            in_flight: counts.1,
            dead_lettered: counts.2,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Lease no longer held for receipt {0}")]
    LeaseLost(String),

    #[error("Message not found: {0}")]
    NotFound(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Redis(_))
    }
}
