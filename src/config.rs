//! Worker Configuration
//!
//! All tunables come from the environment with sensible defaults, so the same
//! binary can be pointed at a local stub stack in tests or at the real
//! platform in deployment without a config file.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Runtime configuration for the worker process.
///
/// One instance is built at startup and shared behind an `Arc`; per-chunk
/// workers read their limits from it but never mutate it.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address the HTTP API binds to.
    pub bind_addr: SocketAddr,
    /// Directory holding one SQLite database per chunk.
    pub data_dir: PathBuf,
    /// Upper bound on concurrent OCR calls within a single fire.
    pub max_parallel_ocr: usize,
    /// Transient-error budget per ref before it is marked failed.
    pub max_retries_per_ref: u32,
    /// Timer-level exceptions absorbed before the chunk enters ERROR.
    pub max_global_retries: u32,
    /// Re-entry cadence for normal phase progress, in milliseconds.
    pub alarm_interval_ms: u64,
    /// OCR provider chat-completions endpoint.
    pub ocr_api_url: String,
    /// Bearer token for the OCR provider.
    pub ocr_api_key: String,
    /// Model identifier sent with each OCR request.
    pub ocr_model: String,
    /// Per-call OCR timeout in milliseconds; a timeout classifies as transient.
    pub ocr_timeout_ms: u64,
    /// Base URL of the CAS entity store.
    pub store_url: String,
    /// Base URL of the orchestrator receiving the final callback.
    pub orchestrator_url: String,
    /// Callback delivery retries after the first failed attempt.
    pub callback_max_retries: u32,
    /// Delay between failed callback attempts, in milliseconds.
    pub callback_retry_delay_ms: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or_else(|| "127.0.0.1:8080".parse().unwrap()),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            max_parallel_ocr: std::env::var("MAX_PARALLEL_OCR")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(20),
            max_retries_per_ref: std::env::var("MAX_RETRIES_PER_REF")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(3),
            max_global_retries: std::env::var("MAX_GLOBAL_RETRIES")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(5),
            alarm_interval_ms: std::env::var("ALARM_INTERVAL_MS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(100),
            ocr_api_url: std::env::var("OCR_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            ocr_api_key: std::env::var("OCR_API_KEY").unwrap_or_default(),
            ocr_model: std::env::var("OCR_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            ocr_timeout_ms: std::env::var("OCR_TIMEOUT_MS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(60_000),
            store_url: std::env::var("STORE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string()),
            orchestrator_url: std::env::var("ORCHESTRATOR_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9100".to_string()),
            callback_max_retries: std::env::var("CALLBACK_MAX_RETRIES")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(3),
            callback_retry_delay_ms: std::env::var("CALLBACK_RETRY_DELAY_MS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(5000),
        }
    }
}
