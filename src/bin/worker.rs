use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use video_ingest::{
    config::AppConfig,
    db::{self, PgStateStore},
    services::{
        analyzer::{pin_thread_pools, CommandAnalyzer},
        queue::RedisQueue,
        reconcile::Reconciler,
        storage::R2Client,
        worker::Worker,
    },
};

fn main() {
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Before any thread exists: the environment is process-global.
    pin_thread_pools(config.max_concurrency);

    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build async runtime");

    runtime.block_on(run(config));
}

async fn run(config: AppConfig) {
    tracing::info!("Starting video ingest worker");

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().expect("METRICS_ADDR must be a socket address");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving worker metrics");
    }
    metrics::describe_counter!("pipeline_messages_received_total", "Messages leased from the queue");
    metrics::describe_counter!("pipeline_messages_total", "Handled messages by outcome");
    metrics::describe_counter!("pipeline_jobs_succeeded_total", "Jobs committed as SUCCEEDED");
    metrics::describe_counter!("pipeline_jobs_failed_total", "Failed processing attempts by kind");
    metrics::describe_counter!("pipeline_claims_lost_total", "Claims lost to a concurrent worker");
    metrics::describe_histogram!("pipeline_processing_seconds", "Analysis time per job");

    tracing::info!("Connecting to PostgreSQL state store");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let objects = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize object storage client");

    let queue = Arc::new(
        RedisQueue::new(&config.redis_url, config.queue_settings())
            .expect("Failed to initialize ingest queue"),
    );
    let state = Arc::new(PgStateStore::new(db_pool));

    let analyzer = CommandAnalyzer::new(
        &config.analyzer_command,
        config.analyzer_args.clone(),
        &config.scratch_dir,
    )
    .with_threads(config.max_concurrency);

    let reconciler = Reconciler::new(
        queue.clone(),
        state.clone(),
        config.key_layout(),
        config.record_ttl(),
        config.queue_settings().retention,
    );

    let worker = Worker::new(
        queue,
        state,
        Arc::new(objects),
        Arc::new(analyzer),
        config.worker_settings(),
    )
    .with_reconciler(reconciler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, finishing current batch");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
