use serde::{Deserialize, Serialize};

/// Lifecycle phase of a chunk worker.
///
/// Phases only move forward within a run; `Done` and `Error` are terminal and
/// differ only in which callback shape they produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Processing,
    Publishing,
    Done,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetching => "FETCHING",
            Phase::Processing => "PROCESSING",
            Phase::Publishing => "PUBLISHING",
            Phase::Done => "DONE",
            Phase::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "FETCHING" => Some(Phase::Fetching),
            "PROCESSING" => Some(Phase::Processing),
            "PUBLISHING" => Some(Phase::Publishing),
            "DONE" => Some(Phase::Done),
            "ERROR" => Some(Phase::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Error)
    }
}

/// Work-queue status of a single ref row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RefStatus {
    Pending,
    Processing,
    Done,
    Skipped,
    Error,
}

impl RefStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefStatus::Pending => "pending",
            RefStatus::Processing => "processing",
            RefStatus::Done => "done",
            RefStatus::Skipped => "skipped",
            RefStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RefStatus::Pending),
            "processing" => Some(RefStatus::Processing),
            "done" => Some(RefStatus::Done),
            "skipped" => Some(RefStatus::Skipped),
            "error" => Some(RefStatus::Error),
            _ => None,
        }
    }
}

/// The single persisted state row of a chunk worker.
#[derive(Debug, Clone)]
pub struct ChunkState {
    pub batch_id: String,
    pub chunk_id: String,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub phase: Phase,
    pub total_refs: u32,
    pub completed_refs: u32,
    pub failed_refs: u32,
    pub skipped_refs: u32,
    pub global_error: Option<String>,
    pub global_retry_count: u32,
    /// Consecutive rate-limited batches; reset on the first clean batch.
    pub consecutive_errors: u32,
    /// Epoch-ms deadline before which no new OCR calls are started.
    pub backoff_until: Option<u64>,
}

impl ChunkState {
    pub fn new(batch_id: &str, chunk_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            chunk_id: chunk_id.to_string(),
            started_at: now_ms(),
            completed_at: None,
            phase: Phase::Fetching,
            total_refs: 0,
            completed_refs: 0,
            failed_refs: 0,
            skipped_refs: 0,
            global_error: None,
            global_retry_count: 0,
            consecutive_errors: 0,
            backoff_until: None,
        }
    }
}

/// One row per entity in the chunk.
///
/// No tip is stored at accept time; PUBLISH resolves a fresh tip immediately
/// before each CAS append.
#[derive(Debug, Clone)]
pub struct PiRecord {
    pub pi: String,
    pub entity_updated: bool,
    pub new_tip: Option<String>,
    pub new_version: Option<u64>,
    pub entity_error: Option<String>,
}

/// One row per image; the primary work item.
#[derive(Debug, Clone)]
pub struct RefRecord {
    pub id: i64,
    pub pi: String,
    pub filename: String,
    pub cdn_url: String,
    pub original_cid: String,
    pub status: RefStatus,
    pub retry_count: u32,
    pub ref_data_json: Option<String>,
    pub result_cid: Option<String>,
    pub ocr_text_length: Option<u32>,
    pub error: Option<String>,
}

/// A ref discovered during FETCH, before it has a row.
#[derive(Debug, Clone)]
pub struct NewRef {
    pub pi: String,
    pub filename: String,
    pub cdn_url: String,
    pub original_cid: String,
    pub ref_data_json: String,
}

/// Outcome of one processed ref, applied to its row together with the
/// updated chunk state in a single transaction so status readers never see a
/// half-applied batch.
#[derive(Debug, Clone)]
pub enum RefAction {
    Complete {
        id: i64,
        status: RefStatus,
        result_cid: String,
        text_length: u32,
    },
    Requeue {
        id: i64,
        bump_retry: bool,
    },
    Fail {
        id: i64,
        message: String,
        bump_retry: bool,
    },
}

/// Per-status row counts over the `refs` table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefCounts {
    pub pending: u32,
    pub processing: u32,
    pub done: u32,
    pub skipped: u32,
    pub error: u32,
}

impl RefCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.processing + self.done + self.skipped + self.error
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
