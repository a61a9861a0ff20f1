use crate::config::WorkerConfig;
use crate::ocr::client::OcrClient;
use crate::persistence::store::ChunkDb;
use crate::persistence::types::{now_ms, Phase};
use crate::store::client::CasClient;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;

/// One stateful worker per accepted chunk.
///
/// The worker is cooperatively single-threaded: exactly one driver task
/// re-enters it, so no two fires ever overlap and every fire sees the state
/// the previous one persisted. Parallelism exists only inside a fire, bounded
/// to `MAX_PARALLEL_OCR` outbound OCR calls that are all awaited before the
/// fire returns.
pub struct ChunkWorker {
    pub(super) batch_id: String,
    pub(super) chunk_id: String,
    pub(super) db: ChunkDb,
    pub(super) config: Arc<WorkerConfig>,
    pub(super) ocr: OcrClient,
    pub(super) cas: CasClient,
    pub(super) http: reqwest::Client,
}

impl ChunkWorker {
    pub fn new(
        db: ChunkDb,
        config: Arc<WorkerConfig>,
        batch_id: &str,
        chunk_id: &str,
    ) -> Arc<Self> {
        let ocr = OcrClient::new(
            &config.ocr_api_url,
            &config.ocr_api_key,
            &config.ocr_model,
            config.ocr_timeout_ms,
        );
        let cas = CasClient::new(&config.store_url);
        Arc::new(Self {
            batch_id: batch_id.to_string(),
            chunk_id: chunk_id.to_string(),
            db,
            config,
            ocr,
            cas,
            http: reqwest::Client::new(),
        })
    }

    /// The driver loop. Sleeps, fires, and lets each fire pick the next
    /// cadence; exits once the chunk has been reported (or its state
    /// deliberately preserved after callback exhaustion).
    pub async fn run(self: Arc<Self>) {
        tracing::info!("Driver started for chunk {}/{}", self.batch_id, self.chunk_id);

        let mut delay = self.config.alarm_interval_ms;
        loop {
            tokio::time::sleep(Duration::from_millis(delay)).await;

            match self.fire().await {
                Ok(Some(next_delay)) => {
                    delay = next_delay;
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(
                        "Fire failed for chunk {}/{}: {:#}",
                        self.batch_id,
                        self.chunk_id,
                        error
                    );
                    match self.absorb_global_error(&error) {
                        Ok(next_delay) => delay = next_delay,
                        Err(fatal) => {
                            // State is unreachable; nothing left to drive.
                            tracing::error!(
                                "Abandoning chunk {}/{}: {:#}",
                                self.batch_id,
                                self.chunk_id,
                                fatal
                            );
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Driver exited for chunk {}/{}", self.batch_id, self.chunk_id);
    }

    /// One fire: read the phase, do that phase's bounded work, return the
    /// next delay. `None` ends the driver.
    async fn fire(&self) -> Result<Option<u64>> {
        let Some(mut state) = self.db.load_state()? else {
            // Tables already dropped; nothing to do.
            return Ok(None);
        };

        match state.phase {
            Phase::Fetching => self.run_fetch(&mut state).await.map(Some),
            Phase::Processing => self.run_process(&mut state).await.map(Some),
            Phase::Publishing => self.run_publish(&mut state).await.map(Some),
            Phase::Done | Phase::Error => self.run_callback(&mut state).await,
        }
    }

    /// Books a timer-level exception against the global retry budget. Once
    /// the budget is spent the chunk enters ERROR and proceeds to the error
    /// callback; until then the next fire is pushed out exponentially.
    fn absorb_global_error(&self, error: &anyhow::Error) -> Result<u64> {
        let Some(mut state) = self.db.load_state()? else {
            return Err(anyhow!("state row missing while absorbing fire error"));
        };

        state.global_retry_count += 1;
        let _ = self.db.log_debug(&format!(
            "fire failed (global retry {}): {error}",
            state.global_retry_count
        ));

        if state.global_retry_count >= self.config.max_global_retries {
            tracing::error!(
                "Chunk {}/{} exhausted global retries, entering ERROR",
                self.batch_id,
                self.chunk_id
            );
            state.phase = Phase::Error;
            state.global_error = Some(error.to_string());
            state.completed_at = Some(now_ms());
            // Callback delivery gets its own retry budget.
            state.global_retry_count = 0;
            self.db.update_state(&state)?;
            return Ok(self.config.alarm_interval_ms);
        }

        let delay = (1000u64 << (state.global_retry_count - 1).min(6)).min(60_000);
        self.db.update_state(&state)?;
        Ok(delay)
    }
}
