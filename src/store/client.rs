use super::types::*;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::Duration;

/// PIs with this prefix live on the test network; every entity-addressed
/// request for them carries the discriminator header.
pub const TEST_NETWORK_PREFIX: &str = "II";
const TEST_NETWORK_HEADER: &str = "x-arke-network";
const TEST_NETWORK_VALUE: &str = "test";

const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// CAS append retry bounds: fresh-tip attempts and the linear delay step.
const CAS_MAX_ATTEMPTS: u32 = 3;
const CAS_RETRY_STEP_MS: u64 = 100;

pub fn is_test_network(pi: &str) -> bool {
    pi.starts_with(TEST_NETWORK_PREFIX)
}

/// Client for the CAS entity store.
#[derive(Clone)]
pub struct CasClient {
    http: reqwest::Client,
    base_url: String,
}

impl CasClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn entity_request(&self, builder: reqwest::RequestBuilder, pi: &str) -> reqwest::RequestBuilder {
        if is_test_network(pi) {
            builder.header(TEST_NETWORK_HEADER, TEST_NETWORK_VALUE)
        } else {
            builder
        }
    }

    /// Uploads a blob and returns its content ID.
    pub async fn upload(&self, blob: Vec<u8>, filename: &str) -> Result<UploadResponse> {
        let response = self
            .http
            .post(format!("{}/blob", self.base_url))
            .query(&[("filename", filename)])
            .body(blob)
            .timeout(STORE_TIMEOUT)
            .send()
            .await
            .map_err(|e| anyhow!("store upload failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("store upload failed: {status} {body}"));
        }
        Ok(response.json().await?)
    }

    /// Fetches the entity manifest: current tip plus the component map.
    pub async fn get_entity(&self, pi: &str) -> Result<EntityRecord> {
        let builder = self
            .http
            .get(format!("{}/entity/{}", self.base_url, pi))
            .timeout(STORE_TIMEOUT);
        let response = self
            .entity_request(builder, pi)
            .send()
            .await
            .map_err(|e| anyhow!("store get_entity({pi}) failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("store get_entity({pi}) failed: {status} {body}"));
        }
        Ok(response.json().await?)
    }

    /// Resolves the entity's current tip without fetching the manifest.
    pub async fn resolve_tip(&self, pi: &str) -> Result<TipResponse> {
        let builder = self
            .http
            .get(format!("{}/entity/{}/tip", self.base_url, pi))
            .timeout(STORE_TIMEOUT);
        let response = self
            .entity_request(builder, pi)
            .send()
            .await
            .map_err(|e| anyhow!("store resolve_tip({pi}) failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("store resolve_tip({pi}) failed: {status} {body}"));
        }
        Ok(response.json().await?)
    }

    /// Downloads a blob by content ID.
    pub async fn download(&self, cid: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(format!("{}/blob/{}", self.base_url, cid))
            .timeout(STORE_TIMEOUT)
            .send()
            .await
            .map_err(|e| anyhow!("store download({cid}) failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("store download({cid}) failed: {status} {body}"));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Appends a new version guarded by `expect_tip`. HTTP 409 from the store
    /// signals that the entity advanced past the expected tip.
    pub async fn append_version(
        &self,
        pi: &str,
        expect_tip: &str,
        components: HashMap<String, String>,
        note: &str,
    ) -> Result<AppendVersionResponse, CasError> {
        let request = AppendVersionRequest {
            expect_tip: expect_tip.to_string(),
            components,
            note: note.to_string(),
        };
        let builder = self
            .http
            .post(format!("{}/entity/{}/versions", self.base_url, pi))
            .json(&request)
            .timeout(STORE_TIMEOUT);
        let response = self
            .entity_request(builder, pi)
            .send()
            .await
            .map_err(|e| CasError::Other(anyhow!("store append_version({pi}) failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(CasError::Conflict(format!(
                "append_version({pi}) expected tip {expect_tip}: {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CasError::Other(anyhow!(
                "store append_version({pi}) failed: {status} {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CasError::Other(anyhow!("invalid append_version response: {e}")))
    }

    /// The publish primitive: resolve a fresh tip immediately before each CAS
    /// attempt, retry conflicts a bounded number of times with a small linear
    /// delay. The tip observed at chunk acceptance is never trusted; other
    /// chunks and external writers may have advanced the entity since.
    pub async fn append_version_cas(
        &self,
        pi: &str,
        components: HashMap<String, String>,
        note: &str,
    ) -> Result<AppendVersionResponse, CasError> {
        let mut last_conflict = None;

        for attempt in 1..=CAS_MAX_ATTEMPTS {
            let tip = self.resolve_tip(pi).await.map_err(CasError::Other)?;

            match self
                .append_version(pi, &tip.tip, components.clone(), note)
                .await
            {
                Ok(response) => return Ok(response),
                Err(CasError::Conflict(message)) => {
                    tracing::warn!(
                        "CAS conflict publishing {} (attempt {}/{}): {}",
                        pi,
                        attempt,
                        CAS_MAX_ATTEMPTS,
                        message
                    );
                    last_conflict = Some(message);
                    if attempt < CAS_MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            CAS_RETRY_STEP_MS * u64::from(attempt),
                        ))
                        .await;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(CasError::Conflict(last_conflict.unwrap_or_else(|| {
            format!("append_version({pi}) exhausted {CAS_MAX_ATTEMPTS} attempts")
        })))
    }
}
