//! PROCESS phase: drain the ref queue against the OCR provider.
//!
//! Each fire claims one bounded batch, fans it out, waits for every call to
//! settle, then classifies outcomes and adjusts the backoff bucket. The batch
//! boundary is where backoff decisions are made.

use super::backoff::BackoffController;
use super::engine::ChunkWorker;
use crate::ocr::classify::{variant_urls, OcrError};
use crate::persistence::types::{now_ms, ChunkState, Phase, RefAction, RefRecord, RefStatus};

use anyhow::Result;

/// Cap on the polling interval while a backoff window is open.
const BACKOFF_POLL_CAP_MS: u64 = 5000;

struct RefOutcome {
    result_cid: String,
    skipped: bool,
    text_length: u32,
}

impl ChunkWorker {
    pub(super) async fn run_process(&self, state: &mut ChunkState) -> Result<u64> {
        let now = now_ms();
        let mut backoff = BackoffController::new(state.consecutive_errors, state.backoff_until);

        if backoff.in_backoff(now) {
            return Ok((backoff.remaining_ms(now) + 100).min(BACKOFF_POLL_CAP_MS));
        }
        if state.backoff_until.is_some() {
            backoff.backoff_until = None;
            state.backoff_until = None;
            self.db.update_state(state)?;
            tracing::debug!(
                "Backoff window expired for chunk {}/{}",
                self.batch_id,
                self.chunk_id
            );
        }

        let batch = self.db.claim_pending_refs(self.config.max_parallel_ocr)?;
        if batch.is_empty() {
            state.phase = Phase::Publishing;
            self.db.update_state(state)?;
            tracing::info!(
                "Chunk {}/{} drained its queue, moving to PUBLISHING",
                self.batch_id,
                self.chunk_id
            );
            return Ok(self.config.alarm_interval_ms);
        }

        tracing::debug!(
            "Chunk {}/{} dispatching {} refs",
            self.batch_id,
            self.chunk_id,
            batch.len()
        );
        let outcomes =
            futures::future::join_all(batch.iter().map(|record| self.process_one_ref(record)))
                .await;

        let mut had_rate_limit = false;
        let mut completed_delta = 0u32;
        let mut failed_delta = 0u32;
        let mut skipped_delta = 0u32;
        let mut actions = Vec::with_capacity(batch.len());

        for (record, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                Ok(result) => {
                    let status = if result.skipped {
                        skipped_delta += 1;
                        RefStatus::Skipped
                    } else {
                        completed_delta += 1;
                        RefStatus::Done
                    };
                    actions.push(RefAction::Complete {
                        id: record.id,
                        status,
                        result_cid: result.result_cid,
                        text_length: result.text_length,
                    });
                }
                Err(OcrError::RateLimit(message)) => {
                    // Back on the queue without spending the retry budget;
                    // the whole chunk pauses instead.
                    had_rate_limit = true;
                    actions.push(RefAction::Requeue {
                        id: record.id,
                        bump_retry: false,
                    });
                    tracing::debug!("Rate limit on {}: {}", record.filename, message);
                }
                Err(OcrError::Permanent(message)) => {
                    failed_delta += 1;
                    self.db
                        .log_debug(&format!("{}: permanent failure: {message}", record.filename))?;
                    actions.push(RefAction::Fail {
                        id: record.id,
                        message,
                        bump_retry: false,
                    });
                }
                Err(OcrError::Transient(message)) => {
                    let retry_count = record.retry_count + 1;
                    if retry_count >= self.config.max_retries_per_ref {
                        failed_delta += 1;
                        self.db.log_debug(&format!(
                            "{}: failed after {retry_count} attempts: {message}",
                            record.filename
                        ))?;
                        actions.push(RefAction::Fail {
                            id: record.id,
                            message,
                            bump_retry: true,
                        });
                    } else {
                        tracing::debug!(
                            "Transient failure on {} (retry {}): {}",
                            record.filename,
                            retry_count,
                            message
                        );
                        actions.push(RefAction::Requeue {
                            id: record.id,
                            bump_retry: true,
                        });
                    }
                }
            }
        }

        if had_rate_limit {
            backoff.on_error(now);
            self.db.log_debug(&format!(
                "rate limited, consecutive_errors={}, backing off {} ms",
                backoff.consecutive_errors,
                backoff.remaining_ms(now)
            ))?;
        } else {
            backoff.on_success();
        }

        state.consecutive_errors = backoff.consecutive_errors;
        state.backoff_until = backoff.backoff_until;
        state.completed_refs += completed_delta;
        state.failed_refs += failed_delta;
        state.skipped_refs += skipped_delta;
        self.db.apply_process_outcomes(&actions, state)?;

        if had_rate_limit {
            Ok((backoff.remaining_ms(now) + 100).min(BACKOFF_POLL_CAP_MS))
        } else {
            Ok(self.config.alarm_interval_ms)
        }
    }

    /// One ref from cached JSON to a stored result.
    ///
    /// Refs that already carry `ocr` text are re-uploaded unchanged and
    /// reported as skipped: no provider call, but still a fresh result CID
    /// for the publish component map.
    async fn process_one_ref(&self, record: &RefRecord) -> Result<RefOutcome, OcrError> {
        let raw = record
            .ref_data_json
            .as_deref()
            .ok_or_else(|| OcrError::Permanent("cached ref JSON missing".to_string()))?;
        let mut doc: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| OcrError::Permanent(format!("invalid ref JSON: {e}")))?;

        if let Some(prior) = doc.get("ocr").and_then(|value| value.as_str()) {
            let text_length = prior.chars().count() as u32;
            let upload = self
                .cas
                .upload(raw.as_bytes().to_vec(), &record.filename)
                .await
                .map_err(|e| OcrError::Transient(e.to_string()))?;
            return Ok(RefOutcome {
                result_cid: upload.cid,
                skipped: true,
                text_length,
            });
        }

        let (primary, fallback) = variant_urls(&record.cdn_url);
        let text = self
            .ocr
            .extract_with_fallback(&primary, fallback.as_deref())
            .await?;
        let text_length = text.chars().count() as u32;

        doc.as_object_mut()
            .ok_or_else(|| OcrError::Permanent("ref JSON is not an object".to_string()))?
            .insert("ocr".to_string(), serde_json::Value::String(text));
        let updated = serde_json::to_string_pretty(&doc)
            .map_err(|e| OcrError::Permanent(format!("serializing updated ref: {e}")))?;

        let upload = self
            .cas
            .upload(updated.into_bytes(), &record.filename)
            .await
            .map_err(|e| OcrError::Transient(e.to_string()))?;

        Ok(RefOutcome {
            result_cid: upload.cid,
            skipped: false,
            text_length,
        })
    }
}
