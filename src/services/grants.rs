use chrono::Utc;
use std::time::Duration;

use crate::models::api::Grant;
use crate::services::storage::{ObjectStore, StorageError, MAX_PRESIGN_EXPIRY};

/// Grant a client a single PUT of `object_key`.
pub async fn issue_upload_grant(
    objects: &dyn ObjectStore,
    object_key: &str,
    ttl: Duration,
) -> Result<Grant, StorageError> {
    let ttl = effective_ttl(ttl);
    let url = objects.presign_put(object_key, ttl).await?;
    grant("PUT", url, object_key, ttl)
}

/// Grant a client a single GET of `object_key`.
pub async fn issue_download_grant(
    objects: &dyn ObjectStore,
    object_key: &str,
    ttl: Duration,
) -> Result<Grant, StorageError> {
    let ttl = effective_ttl(ttl);
    let url = objects.presign_get(object_key, ttl).await?;
    grant("GET", url, object_key, ttl)
}

fn effective_ttl(ttl: Duration) -> Duration {
    ttl.clamp(Duration::from_secs(1), MAX_PRESIGN_EXPIRY)
}

fn grant(method: &str, url: String, object_key: &str, ttl: Duration) -> Result<Grant, StorageError> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| StorageError::Config(e.to_string()))?;
    Ok(Grant {
        method: method.to_string(),
        url,
        object_key: object_key.to_string(),
        expires_at: Utc::now() + ttl,
    })
}
