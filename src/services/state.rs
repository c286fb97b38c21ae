use async_trait::async_trait;

use crate::models::job::{JobRecord, JobStatus};

/// Precondition checked atomically with a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// No live item exists under the key. Expired items count as absent.
    NotExists,
    /// The live item still has this status and attempt (compare-and-swap).
    Matches { status: JobStatus, attempt: u32 },
}

impl Condition {
    /// Expect the stored item to be exactly `record`'s revision.
    pub fn unchanged(record: &JobRecord) -> Self {
        Condition::Matches {
            status: record.status,
            attempt: record.attempt,
        }
    }

    pub fn holds(&self, current: Option<&JobRecord>) -> bool {
        match (self, current) {
            (Condition::NotExists, None) => true,
            (Condition::NotExists, Some(_)) => false,
            (Condition::Matches { .. }, None) => false,
            (Condition::Matches { status, attempt }, Some(record)) => {
                record.status == *status && record.attempt == *attempt
            }
        }
    }
}

/// Key-value store of job records keyed by `(partition_key, sort_key)`.
///
/// Implementations must give read-after-write consistency on a single key
/// and evaluate a `Condition` atomically with the write it guards.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upsert `record`. With a condition, fails with
    /// [`StateError::ConditionFailed`] and writes nothing if it does not hold.
    async fn put(&self, record: &JobRecord, condition: Option<Condition>) -> Result<(), StateError>;

    /// Fetch a live (unexpired) item or [`StateError::NotFound`].
    async fn get(&self, partition_key: &str, sort_key: &str) -> Result<JobRecord, StateError>;

    /// All live items of a partition, in sort-key order.
    async fn query(
        &self,
        partition_key: &str,
        sort_key_prefix: Option<&str>,
    ) -> Result<Vec<JobRecord>, StateError>;

    /// Physically remove expired items. Returns how many were reclaimed.
    async fn purge_expired(&self) -> Result<u64, StateError>;

    async fn health_check(&self) -> Result<(), StateError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Record not found")]
    NotFound,

    #[error("Conditional write rejected")]
    ConditionFailed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}
