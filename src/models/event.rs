use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

/// A new object landed in the object store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCreatedEvent {
    pub object_key: String,
    pub event_time: DateTime<Utc>,
}

/// S3-style bucket notification, as delivered by S3, R2 and MinIO webhooks.
#[derive(Debug, Deserialize)]
pub struct BucketNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    pub s3: NotificationEntity,
}

#[derive(Debug, Deserialize)]
pub struct NotificationEntity {
    pub object: NotificationObject,
}

#[derive(Debug, Deserialize)]
pub struct NotificationObject {
    pub key: String,
}

impl BucketNotification {
    /// Object-created events carried by this notification. Records for
    /// other event types (removals, restores) are dropped.
    pub fn created_events(&self) -> Vec<ObjectCreatedEvent> {
        self.records
            .iter()
            .filter(|r| {
                r.event_name
                    .as_deref()
                    .map_or(true, |name| name.starts_with("ObjectCreated") || name.starts_with("s3:ObjectCreated"))
            })
            .map(|r| ObjectCreatedEvent {
                object_key: decode_object_key(&r.s3.object.key),
                event_time: r.event_time.unwrap_or_else(Utc::now),
            })
            .collect()
    }
}

/// Notification keys are form-encoded: `+` is a space and `%XX` an escaped
/// byte. Malformed escapes are kept verbatim.
pub fn decode_object_key(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}
