//! HTTP Request Handlers
//!
//! Axum route handlers over the `WorkerRegistry`. The surface is deliberately
//! small: the orchestrator submits a chunk, polls its status, and everything
//! else flows through the final callback.

use super::protocol::*;
use super::registry::{SubmitOutcome, WorkerRegistry};

use axum::http::StatusCode;
use axum::{Extension, Json};
use std::sync::Arc;

/// External API: accepts a chunk for processing.
///
/// A chunk already in flight is rejected without touching its state; a
/// terminal chunk is cleared and re-seeded.
pub async fn handle_process(
    Extension(registry): Extension<Arc<WorkerRegistry>>,
    Json(request): Json<ProcessRequest>,
) -> (StatusCode, Json<ProcessResponse>) {
    match registry.submit(&request) {
        Ok(SubmitOutcome::Accepted { total_pis }) => (
            StatusCode::ACCEPTED,
            Json(ProcessResponse {
                status: "accepted".to_string(),
                chunk_id: request.chunk_id,
                total_pis: Some(total_pis),
                total_refs: Some(0),
                phase: None,
            }),
        ),
        Ok(SubmitOutcome::AlreadyProcessing { phase }) => (
            StatusCode::CONFLICT,
            Json(ProcessResponse {
                status: "already_processing".to_string(),
                chunk_id: request.chunk_id,
                total_pis: None,
                total_refs: None,
                phase: Some(phase.as_str().to_string()),
            }),
        ),
        Err(error) => {
            tracing::error!(
                "Failed to accept chunk {}/{}: {:#}",
                request.batch_id,
                request.chunk_id,
                error
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ProcessResponse {
                    status: "error".to_string(),
                    chunk_id: request.chunk_id,
                    total_pis: None,
                    total_refs: None,
                    phase: None,
                }),
            )
        }
    }
}

/// Public API: read-only snapshot of a chunk's progress.
pub async fn handle_status(
    Extension(registry): Extension<Arc<WorkerRegistry>>,
    axum::extract::Path((batch_id, chunk_id)): axum::extract::Path<(String, String)>,
) -> (StatusCode, Json<StatusResponse>) {
    match registry.status(&batch_id, &chunk_id) {
        Ok(response) => {
            let code = if response.status == "not_found" {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            (code, Json(response))
        }
        Err(error) => {
            tracing::error!("Status read failed for {}/{}: {:#}", batch_id, chunk_id, error);
            let mut response = StatusResponse::not_found();
            response.status = "error".to_string();
            response.error = Some(error.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response))
        }
    }
}

/// Liveness answer for operators.
pub async fn handle_health(
    Extension(registry): Extension<Arc<WorkerRegistry>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "ocr-chunk-worker".to_string(),
        live_workers: registry.live_workers(),
    })
}
