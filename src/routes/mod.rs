pub mod admin;
pub mod error;
pub mod events;
pub mod health;
pub mod jobs;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use self::metrics::MetricsState;

/// Bucket notifications batch many records; everything else is tiny.
const BODY_LIMIT: usize = 1024 * 1024;

pub fn build_router(app: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    let metrics_state = MetricsState {
        app: app.clone(),
        handle: prometheus,
    };

    Router::new()
        .route("/health", get(health::health_check))
        .route("/upload-url", post(jobs::create_upload_url))
        .route("/status/{job_id}", get(jobs::get_job_status))
        .route("/result/{job_id}", get(jobs::get_job_result))
        .route("/events/object-created", post(events::object_created))
        .route("/admin/jobs/{job_id}/reprocess", post(admin::reprocess_job))
        .route("/admin/dlq", get(admin::list_dead_letters))
        .route("/admin/dlq/{message_id}/redrive", post(admin::redrive_dead_letter))
        .with_state(app)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
}
