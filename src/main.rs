//! Face Embedding Service
//!
//! Extracts face embeddings from photos through a bounded worker pool and
//! scores embedding similarity with a runtime-selected numerical backend.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use visage::api::rest::{create_rest_router, AppState};
use visage::config::Config;
use visage::engine::FaceExtractor;
use visage::service::FaceService;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting Face Embedding Service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    dotenvy::dotenv().ok();
    let mut config = Config::load(Config::default_path()).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });
    config.apply_env_overrides();

    info!("Configuration loaded:");
    info!("  Port: {}", config.server.port);
    info!("  Device: {}", config.inference.device);
    info!("  Workers: {}", config.queue.workers);
    info!(
        "  Queue capacity: {} (overload threshold {})",
        config.queue.capacity, config.queue.soft_limit
    );

    // Build the embedding backend
    let extractor = build_extractor(&config)?;

    // Build the service context: worker pool, similarity engine, batch
    // scheduler. Everything request handlers touch exists before the
    // listener binds.
    let service = Arc::new(FaceService::new(extractor, config.clone())?);
    let app_state = Arc::new(AppState {
        service: service.clone(),
    });

    let router = create_rest_router(app_state);
    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("REST API listening on http://{addr}");
    info!("Face Embedding Service is ready!");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown signal received, cleaning up...");
    service.shutdown().await;
    info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(feature = "openvino")]
fn build_extractor(config: &Config) -> Result<Arc<dyn FaceExtractor>> {
    let extractor = visage::engine::openvino::OpenVinoExtractor::new(&config.inference)?;
    Ok(Arc::new(extractor))
}

#[cfg(not(feature = "openvino"))]
fn build_extractor(config: &Config) -> Result<Arc<dyn FaceExtractor>> {
    tracing::warn!("Built without the `openvino` feature; no faces will be detected");
    Ok(Arc::new(visage::engine::NoopExtractor::new(
        config.inference.embedding_dim,
    )))
}
