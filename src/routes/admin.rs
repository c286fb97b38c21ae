use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::{DeadLetterList, DeadLetterQuery, RedriveResponse, ReprocessResponse};
use crate::routes::error::ApiResult;

const MAX_DLQ_PAGE: usize = 500;

/// POST /admin/jobs/{job_id}/reprocess
pub async fn reprocess_job(
    State(app): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<(StatusCode, Json<ReprocessResponse>)> {
    let response = app.admin.reprocess(&job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /admin/dlq?offset=&limit=
pub async fn list_dead_letters(
    State(app): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<DeadLetterList>> {
    let list = app.admin.dead_letters(query.offset, query.limit.min(MAX_DLQ_PAGE)).await?;
    Ok(Json(list))
}

/// POST /admin/dlq/{message_id}/redrive
pub async fn redrive_dead_letter(
    State(app): State<AppState>,
    Path(message_id): Path<String>,
) -> ApiResult<(StatusCode, Json<RedriveResponse>)> {
    let response = app.admin.replay_dead_letter(&message_id).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}
