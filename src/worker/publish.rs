//! PUBLISH phase: append one new entity version per PI.
//!
//! Each PI is published independently with a fresh-tip CAS append; a publish
//! failure is recorded on the PI and never fails the chunk; the callback
//! carries the error instead.

use super::engine::ChunkWorker;
use crate::persistence::types::{now_ms, ChunkState, Phase};

use anyhow::Result;
use std::collections::HashMap;

impl ChunkWorker {
    pub(super) async fn run_publish(&self, state: &mut ChunkState) -> Result<u64> {
        for pi in self.db.pis_pending_publish()? {
            let components: HashMap<String, String> =
                self.db.completed_components(&pi.pi)?.into_iter().collect();

            if components.is_empty() {
                self.db.mark_pi_updated(&pi.pi)?;
                tracing::debug!("No completed refs for {}, nothing to publish", pi.pi);
                continue;
            }

            let note = format!("ocr: add extracted text to {} component(s)", components.len());
            match self
                .cas
                .append_version_cas(&pi.pi, components, &note)
                .await
            {
                Ok(response) => {
                    self.db
                        .mark_pi_published(&pi.pi, &response.tip, response.ver)?;
                    tracing::info!(
                        "Published {} at version {} (tip {})",
                        pi.pi,
                        response.ver,
                        response.tip
                    );
                }
                Err(error) => {
                    tracing::warn!("Publish failed for {}: {}", pi.pi, error);
                    self.db.mark_pi_error(&pi.pi, &error.to_string())?;
                    self.db
                        .log_debug(&format!("publish failed for {}: {error}", pi.pi))?;
                }
            }
        }

        state.phase = Phase::Done;
        state.completed_at = Some(now_ms());
        // Callback delivery counts its retries from zero.
        state.global_retry_count = 0;
        self.db.update_state(state)?;
        tracing::info!(
            "Chunk {}/{} published, moving to DONE",
            self.batch_id,
            self.chunk_id
        );

        Ok(self.config.alarm_interval_ms)
    }
}
