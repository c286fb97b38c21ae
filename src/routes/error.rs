use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::admin::AdminError;
use crate::services::notifier::NotifyError;
use crate::services::queue::QueueError;
use crate::services::state::StateError;
use crate::services::storage::StorageError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(#[from] garde::Report),

    #[error("State store error: {0}")]
    State(#[from] StateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ingestion error: {0}")]
    Notify(#[from] NotifyError),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::State(_) | ApiError::Storage(_) | ApiError::Queue(_) | ApiError::Notify(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(e: AdminError) -> Self {
        match e {
            AdminError::NotFound(what) => ApiError::NotFound(what),
            e @ (AdminError::NotFailed { .. } | AdminError::Conflict(_)) => ApiError::Conflict(e.to_string()),
            // Redriven or pruned by someone else since it was looked up.
            AdminError::Queue(QueueError::NotFound(id)) => ApiError::NotFound(format!("dead letter {}", id)),
            AdminError::Queue(e) => ApiError::Queue(e),
            AdminError::State(e) => ApiError::State(e),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed on a dependency");
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;

    #[test]
    fn test_admin_errors_map_to_http() {
        let not_failed = AdminError::NotFailed {
            job_id: "a".into(),
            status: JobStatus::Succeeded,
        };
        assert_eq!(ApiError::from(not_failed).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(AdminError::NotFound("job a".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(AdminError::Queue(QueueError::NotFound("m-1".into()))).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StateError::NotFound).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
