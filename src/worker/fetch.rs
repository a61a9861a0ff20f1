//! FETCH phase: materialize the work queue.
//!
//! Fetching up front turns every later PROCESSING pass into a pure dequeue:
//! the store is touched in FETCH and PUBLISH only, the OCR provider and CDN
//! in PROCESS only.

use super::engine::ChunkWorker;
use crate::persistence::types::{ChunkState, NewRef, Phase};

use anyhow::{Context, Result};

const REF_SUFFIX: &str = ".ref.json";

impl ChunkWorker {
    pub(super) async fn run_fetch(&self, state: &mut ChunkState) -> Result<u64> {
        let pis = self.db.all_pis()?;

        for pi in &pis {
            match self.fetch_entity_refs(&pi.pi).await {
                Ok(refs) => {
                    tracing::debug!("Fetched {} refs for {}", refs.len(), pi.pi);
                    for new_ref in &refs {
                        self.db.insert_ref(new_ref)?;
                    }
                }
                Err(error) => {
                    // The PI stays in the chunk with an empty ref list; its
                    // PUBLISH will no-op and the callback reports zero refs.
                    tracing::warn!("Fetch failed for {}: {:#}", pi.pi, error);
                    self.db
                        .log_debug(&format!("fetch failed for {}: {error}", pi.pi))?;
                }
            }
        }

        state.total_refs = self.db.ref_counts()?.total();
        state.phase = Phase::Processing;
        self.db.update_state(state)?;
        self.db.log_debug(&format!(
            "fetched {} refs across {} entities",
            state.total_refs,
            pis.len()
        ))?;
        tracing::info!(
            "Chunk {}/{} fetched {} refs across {} entities",
            self.batch_id,
            self.chunk_id,
            state.total_refs,
            pis.len()
        );

        Ok(self.config.alarm_interval_ms)
    }

    /// Walks one entity's manifest and downloads every `*.ref.json`
    /// component. A ref document without a `url` is skipped with a warning
    /// and never becomes a row.
    async fn fetch_entity_refs(&self, pi: &str) -> Result<Vec<NewRef>> {
        let entity = self.cas.get_entity(pi).await?;
        let mut refs = Vec::new();

        for (filename, cid) in &entity.components {
            if !filename.ends_with(REF_SUFFIX) {
                continue;
            }

            let bytes = self
                .cas
                .download(cid)
                .await
                .with_context(|| format!("downloading ref {filename} of {pi}"))?;
            let raw = String::from_utf8(bytes)
                .with_context(|| format!("ref {filename} of {pi} is not UTF-8"))?;
            let doc: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("ref {filename} of {pi} is not valid JSON"))?;

            let Some(url) = doc.get("url").and_then(|value| value.as_str()) else {
                tracing::warn!("Ref {} of {} has no url field, skipping", filename, pi);
                self.db
                    .log_debug(&format!("ref {filename} of {pi} has no url, skipped"))?;
                continue;
            };

            refs.push(NewRef {
                pi: pi.to_string(),
                filename: filename.clone(),
                cdn_url: url.to_string(),
                original_cid: cid.clone(),
                ref_data_json: raw,
            });
        }

        Ok(refs)
    }
}
