use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::job::{ErrorInfo, JobRecord, JobStatus};
use crate::services::state::{Condition, StateError, StateStore};

const COLUMNS: &str = "partition_key, sort_key, status, object_key, result_key, attempt, \
                       error_info, expires_at, created_at, updated_at";

/// PostgreSQL-backed job record store.
///
/// Every conditional write is a single statement, so the condition check and
/// the write happen atomically under the row lock.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert, or overwrite the existing row when `overwrite_when` holds for it.
    async fn upsert(&self, record: &JobRecord, overwrite_when: &str) -> Result<u64, StateError> {
        let sql = format!(
            r#"
            INSERT INTO job_records ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (partition_key, sort_key) DO UPDATE
            SET status = EXCLUDED.status,
                object_key = EXCLUDED.object_key,
                result_key = EXCLUDED.result_key,
                attempt = EXCLUDED.attempt,
                error_info = EXCLUDED.error_info,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            WHERE {overwrite_when}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(&record.partition_key)
            .bind(&record.sort_key)
            .bind(record.status.as_ref())
            .bind(&record.object_key)
            .bind(&record.result_key)
            .bind(i64::from(record.attempt))
            .bind(error_info_json(record)?)
            .bind(record.expires_at)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Compare-and-swap update of a live row.
    async fn swap(
        &self,
        record: &JobRecord,
        status: JobStatus,
        attempt: u32,
    ) -> Result<u64, StateError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = $3,
                object_key = $4,
                result_key = $5,
                attempt = $6,
                error_info = $7,
                expires_at = $8,
                updated_at = $9
            WHERE partition_key = $1
              AND sort_key = $2
              AND status = $10
              AND attempt = $11
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(&record.partition_key)
        .bind(&record.sort_key)
        .bind(record.status.as_ref())
        .bind(&record.object_key)
        .bind(&record.result_key)
        .bind(i64::from(record.attempt))
        .bind(error_info_json(record)?)
        .bind(record.expires_at)
        .bind(record.updated_at)
        .bind(status.as_ref())
        .bind(i64::from(attempt))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn put(&self, record: &JobRecord, condition: Option<Condition>) -> Result<(), StateError> {
        let affected = match condition {
            None => self.upsert(record, "TRUE").await?,
            Some(Condition::NotExists) => {
                self.upsert(
                    record,
                    "job_records.expires_at IS NOT NULL AND job_records.expires_at <= NOW()",
                )
                .await?
            }
            Some(Condition::Matches { status, attempt }) => {
                self.swap(record, status, attempt).await?
            }
        };

        if affected == 0 {
            return Err(StateError::ConditionFailed);
        }
        Ok(())
    }

    async fn get(&self, partition_key: &str, sort_key: &str) -> Result<JobRecord, StateError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM job_records
            WHERE partition_key = $1
              AND sort_key = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            "#
        ))
        .bind(partition_key)
        .bind(sort_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => record_from_row(&r),
            None => Err(StateError::NotFound),
        }
    }

    async fn query(
        &self,
        partition_key: &str,
        sort_key_prefix: Option<&str>,
    ) -> Result<Vec<JobRecord>, StateError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM job_records
            WHERE partition_key = $1
              AND starts_with(sort_key, $2)
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY sort_key ASC
            "#
        ))
        .bind(partition_key)
        .bind(sort_key_prefix.unwrap_or(""))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn purge_expired(&self) -> Result<u64, StateError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_records
            WHERE expires_at IS NOT NULL AND expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), StateError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn error_info_json(record: &JobRecord) -> Result<Option<serde_json::Value>, StateError> {
    record
        .error_info
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(StateError::Serialize)
}

fn record_from_row(row: &PgRow) -> Result<JobRecord, StateError> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str)
        .map_err(|_| StateError::Corrupt(format!("unknown status '{}'", status_str)))?;

    let attempt: i64 = row.try_get("attempt")?;
    let attempt = u32::try_from(attempt)
        .map_err(|_| StateError::Corrupt(format!("attempt out of range: {}", attempt)))?;

    let error_info: Option<serde_json::Value> = row.try_get("error_info")?;
    let error_info = error_info
        .map(serde_json::from_value::<ErrorInfo>)
        .transpose()?;

    Ok(JobRecord {
        partition_key: row.try_get("partition_key")?,
        sort_key: row.try_get("sort_key")?,
        status,
        object_key: row.try_get("object_key")?,
        result_key: row.try_get("result_key")?,
        attempt,
        error_info,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
