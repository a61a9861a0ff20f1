//! Callback dispatcher: the chunk's final report to the orchestrator.
//!
//! Delivery is at-least-once: one attempt per fire, a bounded number of
//! retries, cleanup only after a 2xx. After exhaustion the state is kept so
//! `/status` still answers and the orchestrator can rediscover the chunk.

use super::engine::ChunkWorker;
use super::protocol::{callback_url, CallbackPayload, CallbackSummary, FailedRef, PiResult};
use crate::persistence::store::ChunkDb;
use crate::persistence::types::{now_ms, ChunkState, Phase};

use anyhow::{bail, Result};
use std::time::Duration;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

impl ChunkWorker {
    pub(super) async fn run_callback(&self, state: &mut ChunkState) -> Result<Option<u64>> {
        let payload = build_callback_payload(&self.db, state)?;
        let url = callback_url(&self.config.orchestrator_url, &state.batch_id);

        match self.deliver(&url, &payload).await {
            Ok(()) => {
                tracing::info!(
                    "Callback delivered for chunk {}/{} (status {})",
                    self.batch_id,
                    self.chunk_id,
                    payload.status
                );
                self.db.cleanup()?;
                Ok(None)
            }
            Err(error) => {
                tracing::warn!(
                    "Callback failed for chunk {}/{}: {:#}",
                    self.batch_id,
                    self.chunk_id,
                    error
                );
                if state.global_retry_count >= self.config.callback_max_retries {
                    // Keep the tables; the orchestrator owns rediscovery.
                    tracing::error!(
                        "Callback retries exhausted for chunk {}/{}, preserving state",
                        self.batch_id,
                        self.chunk_id
                    );
                    self.db.log_debug("callback retries exhausted, state preserved")?;
                    return Ok(None);
                }
                state.global_retry_count += 1;
                self.db.update_state(state)?;
                self.db.log_debug(&format!(
                    "callback attempt {} failed: {error}",
                    state.global_retry_count
                ))?;
                Ok(Some(self.config.callback_retry_delay_ms))
            }
        }
    }

    async fn deliver(&self, url: &str, payload: &CallbackPayload) -> Result<()> {
        let response = self
            .http
            .post(url)
            .json(payload)
            .timeout(CALLBACK_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("callback returned {}", response.status());
        }
        Ok(())
    }
}

/// Derives the per-PI results and the chunk summary from the database.
///
/// Per-PI status: `error` when the entity update failed or every ref failed;
/// `partial` when completions and failures mix; `success` otherwise. The
/// overall status aggregates the same way, except an ERROR-phase chunk always
/// reports `error`.
pub fn build_callback_payload(db: &ChunkDb, state: &ChunkState) -> Result<CallbackPayload> {
    let mut results = Vec::new();
    let mut all_success = true;
    let mut all_error = true;

    for pi in db.all_pis()? {
        let (completed, failed) = db.pi_ref_stats(&pi.pi)?;
        let failed_list = db.failed_refs_for_pi(&pi.pi)?;

        let status = if pi.entity_error.is_some() || (completed == 0 && failed > 0) {
            "error"
        } else if completed > 0 && failed > 0 {
            "partial"
        } else {
            "success"
        };
        match status {
            "success" => all_error = false,
            "error" => all_success = false,
            _ => {
                all_success = false;
                all_error = false;
            }
        }

        results.push(PiResult {
            pi: pi.pi.clone(),
            status: status.to_string(),
            new_tip: pi.new_tip.clone(),
            new_version: pi.new_version,
            refs_completed: completed,
            refs_failed: failed,
            failed_refs: if failed_list.is_empty() {
                None
            } else {
                Some(
                    failed_list
                        .into_iter()
                        .map(|(filename, error)| FailedRef { filename, error })
                        .collect(),
                )
            },
        });
    }

    let status = if state.phase == Phase::Error {
        "error"
    } else if results.is_empty() || all_success {
        "success"
    } else if all_error {
        "error"
    } else {
        "partial"
    };

    let completed_at = state.completed_at.unwrap_or_else(now_ms);
    Ok(CallbackPayload {
        batch_id: state.batch_id.clone(),
        chunk_id: state.chunk_id.clone(),
        status: status.to_string(),
        results,
        summary: CallbackSummary {
            total_refs: state.total_refs,
            completed: state.completed_refs,
            failed: state.failed_refs,
            skipped: state.skipped_refs,
            processing_time_ms: completed_at.saturating_sub(state.started_at),
        },
        error: state.global_error.clone(),
    })
}
