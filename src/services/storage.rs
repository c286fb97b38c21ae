use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::time::Duration;

/// Durable binary storage for uploads and results.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Fetch an object, or [`StorageError::NotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Pre-signed URL allowing a single-object PUT until `expires_in` elapses.
    async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;

    /// Pre-signed URL allowing a single-object GET until `expires_in` elapses.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;
}

/// Client for S3-compatible object storage (Cloudflare R2, AWS S3, MinIO).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

/// SigV4 caps pre-signed URLs at seven days.
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

fn presign_secs(expires_in: Duration) -> u32 {
    expires_in.as_secs().clamp(1, MAX_PRESIGN_EXPIRY.as_secs()) as u32
}

#[async_trait]
impl ObjectStore for R2Client {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(key, response.status_code())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        check_status(key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let (_, code) = self.bucket.head_object(key).await.map_err(StorageError::S3)?;
        match check_status(key, code) {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        self.bucket
            .presign_put(key, presign_secs(expires_in), None, None)
            .await
            .map_err(StorageError::S3)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        self.bucket
            .presign_get(key, presign_secs(expires_in), None)
            .await
            .map_err(StorageError::S3)
    }
}

fn check_status(key: &str, code: u16) -> Result<(), StorageError> {
    match code {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        code => Err(StorageError::Status {
            code,
            key: key.to_string(),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store returned HTTP {code} for {key}")]
    Status { code: u16, key: String },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::S3(_) => true,
            StorageError::Status { code, .. } => *code >= 500 || *code == 429,
            StorageError::NotFound(_) | StorageError::Config(_) => false,
        }
    }
}
