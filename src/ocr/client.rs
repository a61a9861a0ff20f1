use super::classify::{classify, OcrError};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prompt sent with every OCR request.
pub const OCR_PROMPT: &str = "Extract all text from this image.";
const MAX_TOKENS: u32 = 8192;
const TEMPERATURE: f32 = 0.0;

/// Client for the chat-completions-style OCR provider.
///
/// One request per image; the provider downloads the image itself from the
/// given URL. Every call carries a finite timeout, so a hung provider counts
/// as a transient failure, not a stuck chunk.
#[derive(Clone)]
pub struct OcrClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlRef },
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Serialize)]
struct ImageUrlRef {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OcrClient {
    pub fn new(api_url: &str, api_key: &str, model: &str, timeout_ms: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Single-shot OCR call. Provider and transport failures come back
    /// already classified.
    pub async fn extract_text(&self, image_url: &str) -> Result<String, OcrError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::ImageUrl {
                        image_url: ImageUrlRef {
                            url: image_url.to_string(),
                        },
                    },
                    ContentPart::Text {
                        text: OCR_PROMPT.to_string(),
                    },
                ],
            }],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OcrError::Transient(format!("OCR request timed out: {e}"))
                } else {
                    OcrError::Transient(format!("OCR request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(&format!("{} {}", status.as_u16(), body)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OcrError::Transient(format!("invalid OCR response: {e}")))?;

        if let Some(usage) = &parsed.usage {
            tracing::debug!(
                "OCR call used {} prompt + {} completion tokens",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| OcrError::Transient("empty OCR response".to_string()))
    }

    /// OCR with the variant fallback: if the primary attempt fails because
    /// the provider could not download the (possibly rescaled) image, retry
    /// exactly once against the original asset URL.
    pub async fn extract_with_fallback(
        &self,
        primary: &str,
        fallback: Option<&str>,
    ) -> Result<String, OcrError> {
        match self.extract_text(primary).await {
            Err(error) if error.triggers_fallback() && fallback.is_some() => {
                let fallback = fallback.unwrap();
                tracing::debug!(
                    "OCR could not download {}, retrying with fallback {}",
                    primary,
                    fallback
                );
                self.extract_text(fallback).await
            }
            other => other,
        }
    }
}
