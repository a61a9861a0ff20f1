use thiserror::Error;

/// Failure taxonomy for a single OCR call.
///
/// The phase engine keys its retry policy off this split: rate limits pause
/// the whole chunk, permanent errors are terminal for the ref, everything
/// else is retried against the per-ref budget.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("permanent OCR failure: {0}")]
    Permanent(String),
    #[error("{0}")]
    Transient(String),
}

impl OcrError {
    pub fn message(&self) -> &str {
        match self {
            OcrError::RateLimit(m) | OcrError::Permanent(m) | OcrError::Transient(m) => m,
        }
    }

    /// A "400 + failed to download" fault: the provider could not fetch the
    /// image variant, so the caller may retry once against the original URL.
    pub fn triggers_fallback(&self) -> bool {
        is_download_failure(self.message())
    }
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "429",
    "rate limit",
    "too many requests",
    "rate_limit_exceeded",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "unsupported base64 file format",
    "unsupported file format",
    "invalid image format",
    "failed to process some items",
    "invalid url",
    "image too large",
    "unable to decode image",
    "corrupted image",
];

/// Sorts a raw provider error message into the taxonomy. Matching is
/// case-insensitive substring search; anything unrecognized is transient.
pub fn classify(message: &str) -> OcrError {
    let normalized = message.to_lowercase();

    if RATE_LIMIT_PATTERNS.iter().any(|p| normalized.contains(p)) {
        return OcrError::RateLimit(message.to_string());
    }
    if PERMANENT_PATTERNS.iter().any(|p| normalized.contains(p)) {
        return OcrError::Permanent(message.to_string());
    }
    OcrError::Transient(message.to_string())
}

pub fn is_download_failure(message: &str) -> bool {
    let normalized = message.to_lowercase();
    normalized.contains("400") && normalized.contains("failed to download")
}

/// CDN asset variant rule.
///
/// For URLs matching `…/asset/{ASSET_ID}` (with or without an existing
/// variant segment), the primary attempt uses the `/medium` variant (about
/// 1288 px on the longest side, enough for OCR at a fraction of the token
/// cost) and the bare asset URL is kept as a fallback. Any other URL is
/// used as-is with no fallback.
pub fn variant_urls(cdn_url: &str) -> (String, Option<String>) {
    let re = regex::Regex::new(r"^(.*/asset/[A-Za-z0-9_-]+)(/[A-Za-z0-9_-]+)?/?$").unwrap();
    match re.captures(cdn_url) {
        Some(caps) => {
            let base = caps.get(1).unwrap().as_str();
            (format!("{base}/medium"), Some(base.to_string()))
        }
        None => (cdn_url.to_string(), None),
    }
}
