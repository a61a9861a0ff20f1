use super::engine::ChunkWorker;
use super::protocol::{
    BackoffSummary, ProcessRequest, ProgressSummary, StatusResponse,
};
use crate::config::WorkerConfig;
use crate::persistence::store::ChunkDb;
use crate::persistence::types::Phase;

use anyhow::Result;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Entries of the `/status` debug-log tail.
const DEBUG_TAIL_LEN: u32 = 20;

pub enum SubmitOutcome {
    Accepted { total_pis: usize },
    AlreadyProcessing { phase: Phase },
}

struct WorkerHandle {
    driver: tokio::task::JoinHandle<()>,
}

/// In-process map from `(batch_id, chunk_id)` to the live worker driving that
/// chunk. The registry owns acceptance (including the `already_processing`
/// guard), startup resumption of unfinished chunks, and the read-only status
/// projection.
///
/// Status reads open the chunk database directly rather than going through
/// the live worker: a chunk whose callback delivery was exhausted keeps its
/// state on disk after the driver exits, and must stay inspectable.
pub struct WorkerRegistry {
    config: Arc<WorkerConfig>,
    live: DashMap<String, WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new(config: Arc<WorkerConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            live: DashMap::new(),
        })
    }

    fn key(batch_id: &str, chunk_id: &str) -> String {
        format!("{batch_id}::{chunk_id}")
    }

    fn db_path(&self, batch_id: &str, chunk_id: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}__{}.sqlite3", sanitize(batch_id), sanitize(chunk_id)))
    }

    /// Accepts a chunk. A chunk with non-terminal persisted state is rejected
    /// (the orchestrator never re-submits a chunk in flight); terminal or
    /// absent state is cleared and re-seeded, and a fresh driver is spawned.
    pub fn submit(&self, request: &ProcessRequest) -> Result<SubmitOutcome> {
        let key = Self::key(&request.batch_id, &request.chunk_id);
        let db = ChunkDb::open(&self.db_path(&request.batch_id, &request.chunk_id))?;

        if let Some(state) = db.load_state()? {
            if !state.phase.is_terminal() {
                tracing::info!(
                    "Rejecting chunk {}/{}: already {}",
                    request.batch_id,
                    request.chunk_id,
                    state.phase.as_str()
                );
                return Ok(SubmitOutcome::AlreadyProcessing { phase: state.phase });
            }
        }

        // Any previous driver for this chunk is finished (terminal state) or
        // abandoned; make sure it cannot fire again before re-seeding.
        if let Some((_, stale)) = self.live.remove(&key) {
            stale.driver.abort();
        }

        let pis: Vec<String> = request.pis.iter().map(|p| p.pi.clone()).collect();
        db.init_chunk(&request.batch_id, &request.chunk_id, &pis)?;
        let worker = ChunkWorker::new(db, self.config.clone(), &request.batch_id, &request.chunk_id);
        let driver = tokio::spawn(worker.run());
        self.live.insert(key, WorkerHandle { driver });

        tracing::info!(
            "Accepted chunk {}/{} with {} PIs",
            request.batch_id,
            request.chunk_id,
            pis.len()
        );
        Ok(SubmitOutcome::Accepted { total_pis: pis.len() })
    }

    /// Respawns drivers for every chunk database left on disk with live
    /// state. Rows caught mid-flight by the crash go back on the queue first.
    pub fn resume_existing(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.config.data_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };

        let mut resumed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sqlite3") {
                continue;
            }
            let db = ChunkDb::open(&path)?;
            let Some(state) = db.load_state()? else {
                continue;
            };

            let requeued = db.requeue_inflight_refs()?;
            if requeued > 0 {
                db.log_debug(&format!("requeued {requeued} in-flight refs after restart"))?;
            }
            tracing::info!(
                "Resuming chunk {}/{} in phase {}",
                state.batch_id,
                state.chunk_id,
                state.phase.as_str()
            );

            let key = Self::key(&state.batch_id, &state.chunk_id);
            let worker =
                ChunkWorker::new(db, self.config.clone(), &state.batch_id, &state.chunk_id);
            let driver = tokio::spawn(worker.run());
            self.live.insert(key, WorkerHandle { driver });
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Read-only snapshot for `/status`, straight from the chunk database.
    pub fn status(&self, batch_id: &str, chunk_id: &str) -> Result<StatusResponse> {
        let path = self.db_path(batch_id, chunk_id);
        if !path.exists() {
            return Ok(StatusResponse::not_found());
        }
        let db = ChunkDb::open(&path)?;
        let Some((state, counts)) = db.status_snapshot()? else {
            return Ok(StatusResponse::not_found());
        };

        let status = match state.phase {
            Phase::Done => "done",
            Phase::Error => "error",
            _ => "processing",
        };

        Ok(StatusResponse {
            status: status.to_string(),
            phase: Some(state.phase.as_str().to_string()),
            progress: Some(ProgressSummary {
                total_refs: state.total_refs,
                completed: state.completed_refs,
                failed: state.failed_refs,
                skipped: state.skipped_refs,
                pending: counts.pending + counts.processing,
            }),
            backoff: Some(BackoffSummary {
                consecutive_errors: state.consecutive_errors,
                backoff_until: state.backoff_until.and_then(|until| {
                    chrono::DateTime::from_timestamp_millis(until as i64)
                        .map(|dt| dt.to_rfc3339())
                }),
            }),
            error: state.global_error.clone(),
            debug_log: Some(db.debug_tail(DEBUG_TAIL_LEN)?),
        })
    }

    pub fn live_workers(&self) -> usize {
        self.live.retain(|_, handle| !handle.driver.is_finished());
        self.live.len()
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
