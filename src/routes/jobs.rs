use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{
    JobStatusResponse, ResultResponse, StatusTransition, UploadUrlRequest, UploadUrlResponse,
};
use crate::models::job::{partition_key_for, JobRecord, JobStatus, EVENT_SORT_PREFIX, META_SORT_KEY};
use crate::routes::error::{ApiError, ApiResult};
use crate::services::grants::{issue_download_grant, issue_upload_grant};
use crate::services::state::StateError;

/// POST /upload-url: grant a client a direct upload of one video archive.
pub async fn create_upload_url(
    State(app): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<UploadUrlResponse>)> {
    // The body is optional; an empty request asks for a generated job id.
    let request: UploadUrlRequest = if body.iter().all(u8::is_ascii_whitespace) {
        UploadUrlRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    request.validate()?;

    let job_id = request.job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let object_key = app.settings.layout.object_key_for(&job_id);
    let upload = issue_upload_grant(app.objects.as_ref(), &object_key, app.settings.upload_grant_ttl).await?;

    tracing::info!(job_id = %job_id, object_key = %object_key, "Upload grant issued");
    metrics::counter!("api_upload_grants_total").increment(1);

    Ok((StatusCode::CREATED, Json(UploadUrlResponse { job_id, upload })))
}

/// GET /status/{job_id}: current record plus transition history.
pub async fn get_job_status(
    State(app): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let record = load_meta(&app, &job_id).await?;

    let history = app
        .state
        .query(&record.partition_key, Some(EVENT_SORT_PREFIX))
        .await?
        .iter()
        .map(StatusTransition::from)
        .collect();

    let result = match (record.status, &record.result_key) {
        (JobStatus::Succeeded, Some(key)) => {
            Some(issue_download_grant(app.objects.as_ref(), key, app.settings.download_grant_ttl).await?)
        }
        _ => None,
    };

    Ok(Json(JobStatusResponse {
        job_id,
        status: record.status,
        attempt: record.attempt,
        object_key: record.object_key,
        result_key: record.result_key,
        error: record.error_info,
        created_at: record.created_at,
        updated_at: record.updated_at,
        result,
        history,
    }))
}

/// GET /result/{job_id}: download grant for a finished job's result.
pub async fn get_job_result(
    State(app): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ResultResponse>> {
    let record = load_meta(&app, &job_id).await?;
    let key = match (record.status, record.result_key) {
        (JobStatus::Succeeded, Some(key)) => key,
        (status, _) => {
            return Err(ApiError::not_found(format!("job {} has no result ({})", job_id, status)));
        }
    };

    let download = issue_download_grant(app.objects.as_ref(), &key, app.settings.download_grant_ttl).await?;
    Ok(Json(ResultResponse { job_id, download }))
}

async fn load_meta(app: &AppState, job_id: &str) -> ApiResult<JobRecord> {
    match app.state.get(&partition_key_for(job_id), META_SORT_KEY).await {
        Ok(record) => Ok(record),
        Err(StateError::NotFound) => Err(ApiError::not_found(format!("job {}", job_id))),
        Err(e) => Err(e.into()),
    }
}
