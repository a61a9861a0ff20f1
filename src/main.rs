use axum::{
    routing::{get, post},
    Extension, Router,
};
use ocr_chunk_worker::config::WorkerConfig;
use ocr_chunk_worker::worker::handlers::{handle_health, handle_process, handle_status};
use ocr_chunk_worker::worker::protocol::{ENDPOINT_HEALTH, ENDPOINT_PROCESS, ENDPOINT_STATUS};
use ocr_chunk_worker::worker::registry::WorkerRegistry;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Arc::new(WorkerConfig::from_env());
    tracing::info!("Starting OCR chunk worker on {}", config.bind_addr);
    tracing::info!(
        "Limits: {} parallel OCR calls, {} retries per ref, {} global retries",
        config.max_parallel_ocr,
        config.max_retries_per_ref,
        config.max_global_retries
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let registry = WorkerRegistry::new(config.clone());

    // Pick chunks left unfinished by a previous run back up before accepting
    // new work.
    let resumed = registry.resume_existing()?;
    if resumed > 0 {
        tracing::info!("Resumed {} unfinished chunk(s)", resumed);
    }

    let app = Router::new()
        .route(ENDPOINT_PROCESS, post(handle_process))
        .route(
            &format!("{}/:batch_id/:chunk_id", ENDPOINT_STATUS),
            get(handle_status),
        )
        .route(ENDPOINT_HEALTH, get(handle_health))
        .layer(Extension(registry.clone()));

    tracing::info!("HTTP server listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
