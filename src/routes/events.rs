use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::IngestResponse;
use crate::models::event::BucketNotification;
use crate::routes::error::ApiResult;
use crate::services::notifier::NotifyOutcome;

/// POST /events/object-created: bucket notification webhook.
///
/// Records are processed in order; an enqueue failure fails the whole
/// request so the sender redelivers it. Records already enqueued are
/// enqueued again on redelivery, which the workers absorb.
pub async fn object_created(
    State(app): State<AppState>,
    Json(notification): Json<BucketNotification>,
) -> ApiResult<Json<IngestResponse>> {
    let mut response = IngestResponse::default();
    for event in notification.created_events() {
        match app.notifier.notify(&event).await? {
            NotifyOutcome::Enqueued { job_id, .. } => response.enqueued.push(job_id),
            NotifyOutcome::Skipped => response.skipped.push(event.object_key),
        }
    }
    Ok(Json(response))
}
