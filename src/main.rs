use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use video_ingest::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgStateStore},
    routes,
    services::{queue::RedisQueue, storage::R2Client},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing video-ingest API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("ingest_events_total", "Object-created events by outcome");
    metrics::describe_counter!("api_upload_grants_total", "Upload grants issued");
    metrics::describe_counter!("admin_reprocess_total", "Failed jobs reset for reprocessing");
    metrics::describe_counter!("admin_redrive_total", "Dead letters moved back to the queue");
    metrics::describe_gauge!("pipeline_queue_depth", "Messages in the ingest queue by state");

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL state store");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing object storage client");
    let objects = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize object storage client");

    tracing::info!(queue = %config.queue_name, "Connecting to Redis ingest queue");
    let queue = RedisQueue::new(&config.redis_url, config.queue_settings())
        .expect("Failed to initialize ingest queue");

    let state = AppState::new(
        Arc::new(PgStateStore::new(db_pool)),
        Arc::new(queue),
        Arc::new(objects),
        config.api_settings(),
    );

    let app = routes::build_router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
