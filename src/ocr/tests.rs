//! OCR Module Tests
//!
//! The classifier and the variant rule are pure functions with a fixed
//! pattern table, so they get exhaustive coverage here; the client itself is
//! exercised end-to-end by the worker scenario tests.

#[cfg(test)]
mod tests {
    use crate::ocr::classify::{classify, is_download_failure, variant_urls, OcrError};

    // ============================================================
    // TEST 1: Rate-limit patterns
    // ============================================================

    #[test]
    fn test_rate_limit_classification() {
        let cases = [
            "429 slow down",
            "Rate limit reached for requests",
            "Too Many Requests",
            "error code rate_limit_exceeded",
        ];
        for message in cases {
            assert!(
                matches!(classify(message), OcrError::RateLimit(_)),
                "expected rate-limit for: {message}"
            );
        }
    }

    // ============================================================
    // TEST 2: Permanent patterns
    // ============================================================

    #[test]
    fn test_permanent_classification() {
        let cases = [
            "Unsupported base64 file format",
            "unsupported file format: tiff",
            "Invalid image format",
            "failed to process some items",
            "Invalid URL provided",
            "Image too large to process",
            "unable to decode image",
            "corrupted image data",
        ];
        for message in cases {
            assert!(
                matches!(classify(message), OcrError::Permanent(_)),
                "expected permanent for: {message}"
            );
        }
    }

    // ============================================================
    // TEST 3: Everything else is transient
    // ============================================================

    #[test]
    fn test_transient_classification() {
        let cases = [
            "500 internal server error",
            "connection reset by peer",
            "model overloaded, please retry",
            "",
        ];
        for message in cases {
            assert!(
                matches!(classify(message), OcrError::Transient(_)),
                "expected transient for: {message}"
            );
        }
    }

    #[test]
    fn test_classification_preserves_message() {
        let error = classify("429 please wait");
        assert_eq!(error.message(), "429 please wait");
    }

    // ============================================================
    // TEST 4: Fallback trigger
    // ============================================================

    #[test]
    fn test_download_failure_needs_both_markers() {
        assert!(is_download_failure("400 Failed to download image"));
        assert!(is_download_failure("status 400: failed to download"));
        // Either marker alone does not trigger the fallback
        assert!(!is_download_failure("400 bad request"));
        assert!(!is_download_failure("failed to download image"));
    }

    #[test]
    fn test_download_failure_is_transient_but_triggers_fallback() {
        let error = classify("400 Failed to download the provided image");
        assert!(matches!(error, OcrError::Transient(_)));
        assert!(error.triggers_fallback());
        // A plain 429 never falls back
        assert!(!classify("429 rate limit").triggers_fallback());
    }

    // ============================================================
    // TEST 5: Variant rule
    // ============================================================

    #[test]
    fn test_variant_for_bare_asset_url() {
        let (primary, fallback) = variant_urls("https://cdn.arke.institute/asset/ABC123");
        assert_eq!(primary, "https://cdn.arke.institute/asset/ABC123/medium");
        assert_eq!(
            fallback.as_deref(),
            Some("https://cdn.arke.institute/asset/ABC123")
        );
    }

    #[test]
    fn test_variant_replaces_existing_variant() {
        let (primary, fallback) = variant_urls("https://cdn.arke.institute/asset/ABC123/large");
        assert_eq!(primary, "https://cdn.arke.institute/asset/ABC123/medium");
        assert_eq!(
            fallback.as_deref(),
            Some("https://cdn.arke.institute/asset/ABC123")
        );
    }

    #[test]
    fn test_variant_tolerates_trailing_slash() {
        let (primary, _) = variant_urls("https://cdn.arke.institute/asset/ABC123/");
        assert_eq!(primary, "https://cdn.arke.institute/asset/ABC123/medium");
    }

    #[test]
    fn test_non_asset_url_passes_through() {
        let (primary, fallback) = variant_urls("https://images.example.com/photo.jpg");
        assert_eq!(primary, "https://images.example.com/photo.jpg");
        assert!(fallback.is_none());
    }
}
