use serde::{Deserialize, Serialize};

// Endpoints
pub const ENDPOINT_PROCESS: &str = "/process";
pub const ENDPOINT_STATUS: &str = "/status";
pub const ENDPOINT_HEALTH: &str = "/health";

/// Orchestrator callback target for a batch.
pub fn callback_url(orchestrator_url: &str, batch_id: &str) -> String {
    format!(
        "{}/callback/ocr/{}",
        orchestrator_url.trim_end_matches('/'),
        batch_id
    )
}

// Chunk acceptance (public API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiRef {
    pub pi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub batch_id: String,
    pub chunk_id: String,
    pub pis: Vec<PiRef>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub status: String,
    pub chunk_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pis: Option<usize>,
    /// Always 0 at accept time; refs are only counted once FETCH has walked
    /// the manifests. The orchestrator polls `/status` for the real total.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_refs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

// Status snapshot (public API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub total_refs: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub pending: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSummary {
    pub consecutive_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_log: Option<Vec<String>>,
}

impl StatusResponse {
    pub fn not_found() -> Self {
        Self {
            status: "not_found".to_string(),
            phase: None,
            progress: None,
            backoff: None,
            error: None,
            debug_log: None,
        }
    }
}

// Final callback to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRef {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiResult {
    pub pi: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_tip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<u64>,
    pub refs_completed: u32,
    pub refs_failed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_refs: Option<Vec<FailedRef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSummary {
    pub total_refs: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub batch_id: String,
    pub chunk_id: String,
    pub status: String,
    pub results: Vec<PiResult>,
    pub summary: CallbackSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Liveness (public API)
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub service: String,
    pub live_workers: usize,
}
