use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::app_state::ApiSettings;
use crate::models::job::KeyLayout;
use crate::services::queue::QueueSettings;
use crate::services::worker::WorkerSettings;

/// Process configuration, read from the environment (and `.env`).
///
/// Both binaries load the same struct; the server ignores the worker
/// tunables and vice versa.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for the job state store
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Redis connection string for the ingest queue
    pub redis_url: String,

    /// Key namespace of the queue in Redis
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Bucket holding uploads and results
    pub r2_bucket: String,

    /// S3-compatible endpoint URL
    pub r2_endpoint: String,

    pub r2_access_key: String,

    pub r2_secret_key: String,

    #[serde(default = "default_ingest_prefix")]
    pub ingest_prefix: String,

    #[serde(default = "default_ingest_suffix")]
    pub ingest_suffix: String,

    #[serde(default = "default_result_prefix")]
    pub result_prefix: String,

    /// Deliveries before a message moves to the dead-letter queue
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    #[serde(default = "default_dead_letter_retention_days")]
    pub dead_letter_retention_days: u64,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_per_message_timeout_secs")]
    pub per_message_timeout_secs: u64,

    #[serde(default = "default_lease_margin_secs")]
    pub lease_margin_secs: u64,

    /// Long-poll wait of an empty receive
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,

    /// Messages handled concurrently by one worker, and the thread count
    /// pinned for numeric libraries inside the analysis step
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Job record lifetime; 0 keeps records forever
    #[serde(default = "default_record_ttl_days")]
    pub record_ttl_days: i64,

    #[serde(default = "default_upload_grant_secs")]
    pub upload_grant_secs: u64,

    #[serde(default = "default_download_grant_secs")]
    pub download_grant_secs: u64,

    /// Largest source object a worker will stage
    #[serde(default = "default_ephemeral_scratch_bytes")]
    pub ephemeral_scratch_bytes: u64,

    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Analysis program; source on stdin, result on stdout
    #[serde(default = "default_analyzer_command")]
    pub analyzer_command: String,

    /// Comma-separated analyzer arguments
    #[serde(default)]
    pub analyzer_args: Vec<String>,

    /// Worker-side Prometheus listener (e.g., "0.0.0.0:9100"); disabled when unset
    #[serde(default)]
    pub metrics_addr: Option<String>,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_queue_name() -> String {
    "video_ingest".to_string()
}

fn default_ingest_prefix() -> String {
    "raw/".to_string()
}

fn default_ingest_suffix() -> String {
    ".zip".to_string()
}

fn default_result_prefix() -> String {
    "results/".to_string()
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_dead_letter_retention_days() -> u64 {
    14
}

fn default_visibility_timeout_secs() -> u64 {
    600
}

fn default_per_message_timeout_secs() -> u64 {
    600
}

fn default_lease_margin_secs() -> u64 {
    5
}

fn default_wait_time_secs() -> u64 {
    20
}

fn default_max_concurrency() -> usize {
    1
}

fn default_record_ttl_days() -> i64 {
    30
}

fn default_upload_grant_secs() -> u64 {
    900
}

fn default_download_grant_secs() -> u64 {
    900
}

fn default_ephemeral_scratch_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("video-ingest")
}

fn default_analyzer_command() -> String {
    "analyze-video".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_receive_count == 0 {
            return Err(ConfigError::Invalid("MAX_RECEIVE_COUNT must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("MAX_CONCURRENCY must be at least 1".into()));
        }
        if self.lease_margin_secs >= self.visibility_timeout_secs {
            return Err(ConfigError::Invalid(
                "LEASE_MARGIN_SECS must be shorter than VISIBILITY_TIMEOUT_SECS".into(),
            ));
        }
        if self.ingest_prefix == self.result_prefix {
            return Err(ConfigError::Invalid(
                "INGEST_PREFIX and RESULT_PREFIX must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn key_layout(&self) -> KeyLayout {
        KeyLayout {
            ingest_prefix: self.ingest_prefix.clone(),
            ingest_suffix: self.ingest_suffix.clone(),
            result_prefix: self.result_prefix.clone(),
        }
    }

    pub fn record_ttl(&self) -> Option<chrono::Duration> {
        (self.record_ttl_days > 0).then(|| chrono::Duration::days(self.record_ttl_days))
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            name: self.queue_name.clone(),
            max_receive_count: self.max_receive_count,
            retention: Duration::from_secs(self.dead_letter_retention_days * 24 * 3600),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            batch_size: self.max_concurrency,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            wait_time: Duration::from_secs(self.wait_time_secs),
            per_message_timeout: Duration::from_secs(self.per_message_timeout_secs),
            lease_margin: Duration::from_secs(self.lease_margin_secs),
            max_receive_count: self.max_receive_count,
            scratch_limit_bytes: self.ephemeral_scratch_bytes,
            record_ttl: self.record_ttl(),
            layout: self.key_layout(),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ..WorkerSettings::default()
        }
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            layout: self.key_layout(),
            record_ttl: self.record_ttl(),
            upload_grant_ttl: Duration::from_secs(self.upload_grant_secs),
            download_grant_ttl: Duration::from_secs(self.download_grant_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
