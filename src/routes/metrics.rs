use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::app_state::AppState;
use crate::models::message::QueueDepth;

#[derive(Clone)]
pub struct MetricsState {
    pub app: AppState,
    pub handle: Arc<PrometheusHandle>,
}

/// Prometheus metrics scrape endpoint.
/// Queue depth gauges are refreshed on every scrape.
pub async fn prometheus_metrics(State(metrics): State<MetricsState>) -> impl IntoResponse {
    match metrics.app.queue.depth().await {
        Ok(depth) => record_queue_depth(&depth),
        Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
    }
    metrics.handle.render()
}

pub fn record_queue_depth(depth: &QueueDepth) {
    metrics::gauge!("pipeline_queue_depth", "state" => "available").set(depth.available as f64);
    metrics::gauge!("pipeline_queue_depth", "state" => "in_flight").set(depth.in_flight as f64);
    metrics::gauge!("pipeline_queue_depth", "state" => "dead_lettered").set(depth.dead_lettered as f64);
}
