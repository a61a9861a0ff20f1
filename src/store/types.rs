use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub cid: String,
    pub size: u64,
}

/// Entity manifest as served by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub ver: u64,
    pub manifest_cid: String,
    pub tip: String,
    /// Component filename → content ID.
    #[serde(default)]
    pub components: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipResponse {
    pub id: String,
    pub tip: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendVersionRequest {
    pub expect_tip: String,
    pub components: HashMap<String, String>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendVersionResponse {
    pub ver: u64,
    pub tip: String,
    pub manifest_cid: String,
}

/// Store-side failure split the publish loop keys on: a tip conflict is
/// retried with a fresh tip, anything else surfaces as an entity error.
#[derive(Debug, Error)]
pub enum CasError {
    #[error("tip conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
