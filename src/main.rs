//! Stitch Server
//!
//! Receives file chunks over HTTP, merges them in index order and publishes
//! the merged file to S3-compatible storage.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stitch_server::config::Config;
use stitch_server::routes;
use stitch_server::state::AppState;
use stitch_server::storage::S3Client;
use stitch_server::upload::{
    ChunkStore, CoordinatorSettings, MergeEngine, PublishEngine, RemoteStore, UploadCoordinator,
};

/// How often stale chunk namespaces are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "stitch_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::load();

    tracing::info!("Starting Stitch Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("S3 endpoint: {}", config.storage.endpoint);
    tracing::info!("S3 bucket: {}", config.storage.bucket);
    tracing::info!(
        chunk_dir = %config.upload.chunk_dir.display(),
        merged_dir = %config.upload.merged_dir.display(),
        ordering = ?config.upload.ordering,
        retention = ?config.upload.retention,
        "Upload settings"
    );

    tokio::fs::create_dir_all(&config.upload.chunk_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.upload.chunk_dir.display()))?;
    tokio::fs::create_dir_all(&config.upload.merged_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.upload.merged_dir.display()))?;

    // Initialize S3 client
    let s3_client = S3Client::new(&config.storage)
        .await
        .context("Failed to initialize S3 client")?;
    let remote: Arc<dyn RemoteStore> = Arc::new(s3_client);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upload.publish_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let mut publish_engine = PublishEngine::new(http);
    if config.upload.verify_publish {
        publish_engine = publish_engine.with_verification(remote.clone());
    }

    let coordinator = UploadCoordinator::new(
        ChunkStore::new(&config.upload.chunk_dir),
        MergeEngine::new(&config.upload.merged_dir),
        publish_engine,
        remote,
        CoordinatorSettings::from_config(&config.storage, &config.upload),
    );

    if config.upload.chunk_max_age_hours > 0 {
        let max_age = Duration::from_secs(config.upload.chunk_max_age_hours * 60 * 60);
        coordinator.clone().start_sweep_task(max_age, SWEEP_INTERVAL);
        tracing::info!("Sweeping chunks older than {} hours", config.upload.chunk_max_age_hours);
    }

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST {}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);

    let app = routes::app(AppState::new(config, coordinator));

    // Start server with graceful shutdown
    tracing::info!("Stitch Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
