//! Worker Module Tests
//!
//! This module contains unit and scenario tests for the chunk processing
//! engine.
//!
//! ## Test Scopes
//! - **Backoff**: Verifies the exponential window math and reset behavior.
//! - **Callback derivation**: Validates per-PI and overall status rules.
//! - **Scenarios**: Drives a real worker end-to-end against in-process stub
//!   collaborators (OCR provider, CAS store, orchestrator callback sink).

#[cfg(test)]
mod tests {
    use crate::config::WorkerConfig;
    use crate::persistence::store::ChunkDb;
    use crate::persistence::types::{NewRef, Phase, RefAction, RefStatus};
    use crate::store::types::AppendVersionRequest;
    use crate::worker::backoff::{BackoffController, MAX_DELAY_MS};
    use crate::worker::callback::build_callback_payload;
    use crate::worker::engine::ChunkWorker;
    use crate::worker::protocol::{CallbackPayload, PiRef, ProcessRequest};
    use crate::worker::registry::{SubmitOutcome, WorkerRegistry};

    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Extension, Json, Router};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // ============================================================
    // TEST 1: Backoff window math
    // ============================================================

    #[test]
    fn test_backoff_window_bounds() {
        let now = 1_000_000u64;
        for k in 1u32..=8 {
            // ARRANGE: k-1 errors already recorded
            let mut backoff = BackoffController::new(k - 1, None);

            // ACT
            backoff.on_error(now);

            // ASSERT: window within ±25% of min(60s, 1000 * 2^min(k-1, 5))
            let expected = (1000u64 << (k - 1).min(5)).min(MAX_DELAY_MS);
            let delta = backoff.backoff_until.unwrap() - now;
            assert!(
                delta as f64 >= expected as f64 * 0.75 - 1.0,
                "k={k}: window {delta} below jitter floor for base {expected}"
            );
            assert!(
                delta as f64 <= expected as f64 * 1.25 + 1.0,
                "k={k}: window {delta} above jitter ceiling for base {expected}"
            );
            assert_eq!(backoff.consecutive_errors, k);
        }
    }

    #[test]
    fn test_backoff_caps_at_32_seconds_base() {
        let now = 0u64;
        // Far beyond the exponent cap
        let mut backoff = BackoffController::new(40, None);
        backoff.on_error(now);
        let delta = backoff.backoff_until.unwrap();
        assert!(delta as f64 <= 32_000.0 * 1.25 + 1.0);
    }

    #[test]
    fn test_backoff_success_resets() {
        let mut backoff = BackoffController::new(3, Some(99_999));
        backoff.on_success();
        assert_eq!(backoff.consecutive_errors, 0);
        assert!(backoff.backoff_until.is_none());
        assert!(!backoff.in_backoff(0));
    }

    #[test]
    fn test_backoff_window_expiry() {
        let backoff = BackoffController::new(1, Some(1000));
        assert!(backoff.in_backoff(999));
        assert!(!backoff.in_backoff(1000));
        assert_eq!(backoff.remaining_ms(400), 600);
        assert_eq!(backoff.remaining_ms(2000), 0);
    }

    // ============================================================
    // TEST 2: Callback status derivation
    // ============================================================

    fn callback_fixture() -> (ChunkDb, crate::persistence::types::ChunkState) {
        let db = ChunkDb::open_in_memory().unwrap();
        db.init_chunk(
            "batch-cb",
            "chunk-cb",
            &["PI-A".to_string(), "PI-B".to_string()],
        )
        .unwrap();
        let state = db.load_state().unwrap().unwrap();
        (db, state)
    }

    /// Inserts the given `(pi, filename, outcome)` refs and settles them the
    /// way a PROCESS fire would.
    fn seed_refs(db: &ChunkDb, specs: &[(&str, &str, &str)]) {
        for (pi, filename, _) in specs {
            db.insert_ref(&NewRef {
                pi: pi.to_string(),
                filename: filename.to_string(),
                cdn_url: "https://cdn.example.com/x.jpg".to_string(),
                original_cid: format!("cid-{filename}"),
                ref_data_json: r#"{"url":"https://cdn.example.com/x.jpg"}"#.to_string(),
            })
            .unwrap();
        }
        let claimed = db.claim_pending_refs(100).unwrap();
        let state = db.load_state().unwrap().unwrap();
        let actions: Vec<RefAction> = claimed
            .iter()
            .map(|record| {
                let outcome = specs
                    .iter()
                    .find(|(pi, filename, _)| record.pi == *pi && record.filename == *filename)
                    .unwrap()
                    .2;
                match outcome {
                    "done" => RefAction::Complete {
                        id: record.id,
                        status: RefStatus::Done,
                        result_cid: format!("result-{}", record.filename),
                        text_length: 5,
                    },
                    "error" => RefAction::Fail {
                        id: record.id,
                        message: "unsupported file format".to_string(),
                        bump_retry: false,
                    },
                    other => panic!("unknown outcome {other}"),
                }
            })
            .collect();
        db.apply_process_outcomes(&actions, &state).unwrap();
    }

    #[test]
    fn test_callback_partial_pi_and_failed_ref_listing() {
        // ARRANGE: PI-A has one success and one failure, PI-B has one success
        let (db, mut state) = callback_fixture();
        seed_refs(
            &db,
            &[
                ("PI-A", "good.ref.json", "done"),
                ("PI-A", "bad.ref.json", "error"),
                ("PI-B", "ok.ref.json", "done"),
            ],
        );
        db.mark_pi_published("PI-A", "tip-2", 2).unwrap();
        db.mark_pi_published("PI-B", "tip-5", 5).unwrap();
        state.phase = Phase::Done;
        state.total_refs = 3;
        state.completed_refs = 2;
        state.failed_refs = 1;

        // ACT
        let payload = build_callback_payload(&db, &state).unwrap();

        // ASSERT
        assert_eq!(payload.status, "partial");
        let a = payload.results.iter().find(|r| r.pi == "PI-A").unwrap();
        assert_eq!(a.status, "partial");
        assert_eq!(a.refs_completed, 1);
        assert_eq!(a.refs_failed, 1);
        assert_eq!(a.new_version, Some(2));
        let failed = a.failed_refs.as_ref().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].filename, "bad.ref.json");
        assert!(failed[0].error.contains("unsupported"));
        let b = payload.results.iter().find(|r| r.pi == "PI-B").unwrap();
        assert_eq!(b.status, "success");
        assert!(b.failed_refs.is_none());
    }

    #[test]
    fn test_callback_all_refs_failed_is_error() {
        let (db, mut state) = callback_fixture();
        seed_refs(
            &db,
            &[
                ("PI-A", "bad.ref.json", "error"),
                ("PI-B", "worse.ref.json", "error"),
            ],
        );
        db.mark_pi_updated("PI-A").unwrap();
        db.mark_pi_updated("PI-B").unwrap();
        state.phase = Phase::Done;

        let payload = build_callback_payload(&db, &state).unwrap();

        assert_eq!(payload.status, "error");
        assert!(payload.results.iter().all(|r| r.status == "error"));
    }

    #[test]
    fn test_callback_entity_error_wins_over_completed_refs() {
        let (db, mut state) = callback_fixture();
        seed_refs(&db, &[("PI-A", "good.ref.json", "done")]);
        db.mark_pi_error("PI-A", "store rejected the append").unwrap();
        db.mark_pi_updated("PI-B").unwrap();
        state.phase = Phase::Done;

        let payload = build_callback_payload(&db, &state).unwrap();

        let a = payload.results.iter().find(|r| r.pi == "PI-A").unwrap();
        assert_eq!(a.status, "error");
        // PI-B had nothing to do, which counts as success
        let b = payload.results.iter().find(|r| r.pi == "PI-B").unwrap();
        assert_eq!(b.status, "success");
        assert_eq!(payload.status, "partial");
    }

    #[test]
    fn test_callback_error_phase_is_always_error() {
        let (db, mut state) = callback_fixture();
        db.mark_pi_updated("PI-A").unwrap();
        db.mark_pi_updated("PI-B").unwrap();
        state.phase = Phase::Error;
        state.global_error = Some("exhausted global retries".to_string());

        let payload = build_callback_payload(&db, &state).unwrap();

        assert_eq!(payload.status, "error");
        assert_eq!(payload.error.as_deref(), Some("exhausted global retries"));
    }

    #[test]
    fn test_callback_empty_chunk_is_success() {
        let db = ChunkDb::open_in_memory().unwrap();
        db.init_chunk("batch-cb", "chunk-cb", &[]).unwrap();
        let mut state = db.load_state().unwrap().unwrap();
        state.phase = Phase::Done;

        let payload = build_callback_payload(&db, &state).unwrap();

        assert_eq!(payload.status, "success");
        assert!(payload.results.is_empty());
        assert_eq!(payload.summary.total_refs, 0);
    }

    // ============================================================
    // Stub collaborators for scenario tests
    // ============================================================

    enum OcrReply {
        Text(String),
        Fault(u16, String),
    }

    struct StubEntity {
        tip: String,
        ver: u64,
        components: HashMap<String, String>,
    }

    /// One in-process server standing in for every collaborator: the CAS
    /// store, the OCR provider, and the orchestrator callback sink.
    #[derive(Default)]
    struct StubPlatform {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        entities: Mutex<HashMap<String, StubEntity>>,
        upload_seq: AtomicU32,
        ocr_calls: Mutex<Vec<String>>,
        ocr_replies: Mutex<HashMap<String, VecDeque<OcrReply>>>,
        ocr_default_text: Mutex<String>,
        ocr_delay_ms: AtomicU64,
        append_attempts: AtomicU32,
        conflict_once: AtomicBool,
        callbacks: Mutex<Vec<CallbackPayload>>,
        callback_attempts: AtomicU32,
        callback_failures_left: AtomicU32,
    }

    impl StubPlatform {
        /// Registers an entity whose components are ref JSON documents.
        fn add_entity(&self, pi: &str, refs: &[(&str, &str)]) {
            let mut components = HashMap::new();
            let mut blobs = self.blobs.lock().unwrap();
            for (filename, ref_json) in refs {
                let cid = format!("orig-{filename}");
                blobs.insert(cid.clone(), ref_json.as_bytes().to_vec());
                components.insert(filename.to_string(), cid);
            }
            self.entities.lock().unwrap().insert(
                pi.to_string(),
                StubEntity {
                    tip: "tip-1".to_string(),
                    ver: 1,
                    components,
                },
            );
        }

        fn script_ocr(&self, url: &str, reply: OcrReply) {
            self.ocr_replies
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(reply);
        }

        async fn wait_for_callback(&self) -> CallbackPayload {
            for _ in 0..500 {
                if let Some(payload) = self.callbacks.lock().unwrap().first() {
                    return payload.clone();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("no callback delivered within 10s");
        }
    }

    async fn stub_upload(
        Extension(stub): Extension<Arc<StubPlatform>>,
        Query(_params): Query<HashMap<String, String>>,
        body: axum::body::Bytes,
    ) -> Json<serde_json::Value> {
        let seq = stub.upload_seq.fetch_add(1, Ordering::SeqCst);
        let cid = format!("stub-cid-{seq}");
        let size = body.len() as u64;
        stub.blobs.lock().unwrap().insert(cid.clone(), body.to_vec());
        Json(serde_json::json!({ "cid": cid, "size": size }))
    }

    async fn stub_download(
        Extension(stub): Extension<Arc<StubPlatform>>,
        Path(cid): Path<String>,
    ) -> axum::response::Response {
        match stub.blobs.lock().unwrap().get(&cid) {
            Some(bytes) => bytes.clone().into_response(),
            None => (StatusCode::NOT_FOUND, "no such blob").into_response(),
        }
    }

    async fn stub_get_entity(
        Extension(stub): Extension<Arc<StubPlatform>>,
        Path(pi): Path<String>,
    ) -> axum::response::Response {
        match stub.entities.lock().unwrap().get(&pi) {
            Some(entity) => Json(serde_json::json!({
                "id": pi,
                "ver": entity.ver,
                "manifest_cid": format!("manifest-{}", entity.ver),
                "tip": entity.tip,
                "components": entity.components,
            }))
            .into_response(),
            None => (StatusCode::NOT_FOUND, "no such entity").into_response(),
        }
    }

    async fn stub_resolve_tip(
        Extension(stub): Extension<Arc<StubPlatform>>,
        Path(pi): Path<String>,
    ) -> axum::response::Response {
        match stub.entities.lock().unwrap().get(&pi) {
            Some(entity) => {
                Json(serde_json::json!({ "id": pi, "tip": entity.tip })).into_response()
            }
            None => (StatusCode::NOT_FOUND, "no such entity").into_response(),
        }
    }

    async fn stub_append_version(
        Extension(stub): Extension<Arc<StubPlatform>>,
        Path(pi): Path<String>,
        Json(request): Json<AppendVersionRequest>,
    ) -> axum::response::Response {
        stub.append_attempts.fetch_add(1, Ordering::SeqCst);
        let mut entities = stub.entities.lock().unwrap();
        let Some(entity) = entities.get_mut(&pi) else {
            return (StatusCode::NOT_FOUND, "no such entity").into_response();
        };

        if stub.conflict_once.swap(false, Ordering::SeqCst) {
            // An external writer advances the tip right under the append.
            entity.ver += 1;
            entity.tip = format!("tip-ext-{}", entity.ver);
            return (StatusCode::CONFLICT, "tip mismatch").into_response();
        }
        if request.expect_tip != entity.tip {
            return (StatusCode::CONFLICT, "tip mismatch").into_response();
        }

        entity.ver += 1;
        entity.tip = format!("tip-{}", entity.ver);
        entity.components.extend(request.components);
        Json(serde_json::json!({
            "ver": entity.ver,
            "tip": entity.tip,
            "manifest_cid": format!("manifest-{}", entity.ver),
        }))
        .into_response()
    }

    async fn stub_ocr(
        Extension(stub): Extension<Arc<StubPlatform>>,
        Json(request): Json<serde_json::Value>,
    ) -> axum::response::Response {
        let url = request["messages"][0]["content"][0]["image_url"]["url"]
            .as_str()
            .unwrap_or("")
            .to_string();
        stub.ocr_calls.lock().unwrap().push(url.clone());

        let reply = stub
            .ocr_replies
            .lock()
            .unwrap()
            .get_mut(&url)
            .and_then(|queue| queue.pop_front());

        let delay = stub.ocr_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match reply {
            Some(OcrReply::Fault(code, body)) => {
                (StatusCode::from_u16(code).unwrap(), body).into_response()
            }
            Some(OcrReply::Text(text)) => ocr_success(&text),
            None => {
                let text = stub.ocr_default_text.lock().unwrap().clone();
                ocr_success(&text)
            }
        }
    }

    fn ocr_success(text: &str) -> axum::response::Response {
        Json(serde_json::json!({
            "choices": [ { "message": { "content": text } } ],
            "usage": { "prompt_tokens": 20, "completion_tokens": 8 },
        }))
        .into_response()
    }

    async fn stub_callback(
        Extension(stub): Extension<Arc<StubPlatform>>,
        Path(_batch_id): Path<String>,
        Json(payload): Json<CallbackPayload>,
    ) -> StatusCode {
        stub.callback_attempts.fetch_add(1, Ordering::SeqCst);
        if stub
            .callback_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        stub.callbacks.lock().unwrap().push(payload);
        StatusCode::OK
    }

    async fn spawn_platform() -> (String, Arc<StubPlatform>) {
        let stub = Arc::new(StubPlatform {
            ocr_default_text: Mutex::new("Hello".to_string()),
            ..Default::default()
        });
        let app = Router::new()
            .route("/blob", post(stub_upload))
            .route("/blob/:cid", get(stub_download))
            .route("/entity/:pi", get(stub_get_entity))
            .route("/entity/:pi/tip", get(stub_resolve_tip))
            .route("/entity/:pi/versions", post(stub_append_version))
            .route("/ocr", post(stub_ocr))
            .route("/callback/ocr/:batch_id", post(stub_callback))
            .layer(Extension(stub.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), stub)
    }

    fn test_config(base_url: &str, data_dir: &std::path::Path) -> Arc<WorkerConfig> {
        Arc::new(WorkerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: data_dir.to_path_buf(),
            max_parallel_ocr: 20,
            max_retries_per_ref: 3,
            max_global_retries: 5,
            alarm_interval_ms: 10,
            ocr_api_url: format!("{base_url}/ocr"),
            ocr_api_key: "test-key".to_string(),
            ocr_model: "test-model".to_string(),
            ocr_timeout_ms: 5000,
            store_url: base_url.to_string(),
            orchestrator_url: base_url.to_string(),
            callback_max_retries: 3,
            callback_retry_delay_ms: 50,
        })
    }

    /// Seeds a chunk database and spawns its driver, the way the registry
    /// does on `/process`.
    fn start_chunk(
        config: &Arc<WorkerConfig>,
        batch_id: &str,
        chunk_id: &str,
        pis: &[&str],
    ) -> ChunkDb {
        let path = config.data_dir.join(format!("{batch_id}__{chunk_id}.sqlite3"));
        let db = ChunkDb::open(&path).unwrap();
        let pis: Vec<String> = pis.iter().map(|pi| pi.to_string()).collect();
        db.init_chunk(batch_id, chunk_id, &pis).unwrap();
        let worker = ChunkWorker::new(db.clone(), config.clone(), batch_id, chunk_id);
        tokio::spawn(worker.run());
        db
    }

    // ============================================================
    // TEST 3: Scenario: happy path, one PI, one ref
    // ============================================================

    #[tokio::test]
    async fn test_scenario_happy_path_single_ref() {
        // ARRANGE
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0001",
            &[("img.jpg.ref.json", r#"{"url":"https://cdn.example.com/img.jpg"}"#)],
        );
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        // ACT
        let db = start_chunk(&config, "batch-1", "chunk-1", &["PI-0001"]);
        let payload = stub.wait_for_callback().await;

        // ASSERT: callback shape
        assert_eq!(payload.status, "success");
        assert_eq!(payload.batch_id, "batch-1");
        assert_eq!(payload.chunk_id, "chunk-1");
        assert_eq!(payload.summary.total_refs, 1);
        assert_eq!(payload.summary.completed, 1);
        assert_eq!(payload.summary.failed, 0);
        let result = &payload.results[0];
        assert_eq!(result.pi, "PI-0001");
        assert_eq!(result.refs_completed, 1);
        assert_eq!(result.new_version, Some(2));

        // ASSERT: entity advanced and the stored ref JSON carries the text
        let entities = stub.entities.lock().unwrap();
        let entity = entities.get("PI-0001").unwrap();
        assert_eq!(entity.ver, 2);
        let new_cid = entity.components.get("img.jpg.ref.json").unwrap();
        assert!(new_cid.starts_with("stub-cid-"));
        let blob = stub.blobs.lock().unwrap().get(new_cid).unwrap().clone();
        let doc: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(doc["ocr"], "Hello");
        assert_eq!(doc["url"], "https://cdn.example.com/img.jpg");

        // ASSERT: tables dropped after the delivered callback
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(db.load_state().unwrap().is_none());
    }

    // ============================================================
    // TEST 4: Scenario: rate limit, backoff, then success
    // ============================================================

    #[tokio::test]
    async fn test_scenario_rate_limit_then_success() {
        // ARRANGE: first call throttled, retry succeeds
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0002",
            &[("img.jpg.ref.json", r#"{"url":"https://cdn.example.com/img.jpg"}"#)],
        );
        stub.script_ocr(
            "https://cdn.example.com/img.jpg",
            OcrReply::Fault(429, "429 Too Many Requests".to_string()),
        );
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        // ACT
        let db = start_chunk(&config, "batch-2", "chunk-1", &["PI-0002"]);

        // ASSERT: the backoff window is observable while it is open
        let mut saw_backoff = false;
        for _ in 0..100 {
            if let Some(state) = db.load_state().unwrap() {
                if state.consecutive_errors == 1 && state.backoff_until.is_some() {
                    saw_backoff = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_backoff, "backoff window never became visible");

        // ASSERT: the chunk still completes once the window expires
        let payload = stub.wait_for_callback().await;
        assert_eq!(payload.status, "success");
        assert_eq!(payload.summary.completed, 1);
        assert_eq!(stub.ocr_calls.lock().unwrap().len(), 2);
    }

    // ============================================================
    // TEST 5: Scenario: permanent failure mixed with success
    // ============================================================

    #[tokio::test]
    async fn test_scenario_permanent_failure_mixed() {
        // ARRANGE: two refs, one healthy, one permanently rejected
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0003",
            &[
                ("good.jpg.ref.json", r#"{"url":"https://cdn.example.com/good.jpg"}"#),
                ("bad.tiff.ref.json", r#"{"url":"https://cdn.example.com/bad.tiff"}"#),
            ],
        );
        stub.script_ocr(
            "https://cdn.example.com/bad.tiff",
            OcrReply::Fault(400, "Unsupported file format: tiff".to_string()),
        );
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        // ACT
        start_chunk(&config, "batch-3", "chunk-1", &["PI-0003"]);
        let payload = stub.wait_for_callback().await;

        // ASSERT: per-PI partial with the failure listed
        assert_eq!(payload.status, "partial");
        let result = &payload.results[0];
        assert_eq!(result.status, "partial");
        assert_eq!(result.refs_completed, 1);
        assert_eq!(result.refs_failed, 1);
        let failed = result.failed_refs.as_ref().unwrap();
        assert_eq!(failed[0].filename, "bad.tiff.ref.json");
        assert!(failed[0].error.to_lowercase().contains("unsupported file format"));

        // ASSERT: entity updated with the successful component only
        let entities = stub.entities.lock().unwrap();
        let entity = entities.get("PI-0003").unwrap();
        assert_eq!(entity.ver, 2);
        assert!(entity
            .components
            .get("good.jpg.ref.json")
            .unwrap()
            .starts_with("stub-cid-"));
        assert_eq!(
            entity.components.get("bad.tiff.ref.json").unwrap(),
            "orig-bad.tiff.ref.json"
        );
        // Exactly one provider call per ref, no retry for the permanent one
        assert_eq!(stub.ocr_calls.lock().unwrap().len(), 2);
    }

    // ============================================================
    // TEST 6: Scenario: CAS conflict resolved with a fresh tip
    // ============================================================

    #[tokio::test]
    async fn test_scenario_cas_conflict_then_resolution() {
        // ARRANGE: an external writer advances the tip under the first append
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0004",
            &[("img.jpg.ref.json", r#"{"url":"https://cdn.example.com/img.jpg"}"#)],
        );
        stub.conflict_once.store(true, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        // ACT
        start_chunk(&config, "batch-4", "chunk-1", &["PI-0004"]);
        let payload = stub.wait_for_callback().await;

        // ASSERT: the second attempt landed on the moved tip
        assert_eq!(payload.status, "success");
        let result = &payload.results[0];
        assert_eq!(result.new_version, Some(3));
        assert!(result.new_tip.as_deref().unwrap().starts_with("tip-"));
        assert_eq!(stub.append_attempts.load(Ordering::SeqCst), 2);
    }

    // ============================================================
    // TEST 7: Scenario: variant fallback on download failure
    // ============================================================

    #[tokio::test]
    async fn test_scenario_variant_fallback() {
        // ARRANGE: the /medium variant cannot be downloaded by the provider
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0005",
            &[("scan.jpg.ref.json", r#"{"url":"https://cdn.arke.institute/asset/ABC123"}"#)],
        );
        stub.script_ocr(
            "https://cdn.arke.institute/asset/ABC123/medium",
            OcrReply::Fault(400, "400 Failed to download image".to_string()),
        );
        stub.script_ocr(
            "https://cdn.arke.institute/asset/ABC123",
            OcrReply::Text("recovered text".to_string()),
        );
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        // ACT
        start_chunk(&config, "batch-5", "chunk-1", &["PI-0005"]);
        let payload = stub.wait_for_callback().await;

        // ASSERT: exactly one extra call, against the bare asset URL
        let calls = stub.ocr_calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "https://cdn.arke.institute/asset/ABC123/medium".to_string(),
                "https://cdn.arke.institute/asset/ABC123".to_string(),
            ]
        );
        assert_eq!(payload.status, "success");
        assert_eq!(payload.summary.completed, 1);
    }

    // ============================================================
    // TEST 8: Scenario: ref that already carries OCR is skipped
    // ============================================================

    #[tokio::test]
    async fn test_scenario_existing_ocr_skipped() {
        // ARRANGE
        let (base_url, stub) = spawn_platform().await;
        let ref_json = r#"{"url":"https://cdn.example.com/img.jpg","ocr":"prior"}"#;
        stub.add_entity("PI-0006", &[("img.jpg.ref.json", ref_json)]);
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        // ACT
        start_chunk(&config, "batch-6", "chunk-1", &["PI-0006"]);
        let payload = stub.wait_for_callback().await;

        // ASSERT: no provider call, skipped counter, entity still published
        assert!(stub.ocr_calls.lock().unwrap().is_empty());
        assert_eq!(payload.status, "success");
        assert_eq!(payload.summary.skipped, 1);
        assert_eq!(payload.summary.completed, 0);
        assert_eq!(payload.results[0].refs_completed, 1);

        // The re-uploaded ref JSON is byte-identical to the original
        let entities = stub.entities.lock().unwrap();
        let entity = entities.get("PI-0006").unwrap();
        assert_eq!(entity.ver, 2);
        let new_cid = entity.components.get("img.jpg.ref.json").unwrap();
        let blob = stub.blobs.lock().unwrap().get(new_cid).unwrap().clone();
        assert_eq!(blob, ref_json.as_bytes());
    }

    // ============================================================
    // TEST 9: Scenario: callback redelivery after a failed attempt
    // ============================================================

    #[tokio::test]
    async fn test_scenario_callback_retries_until_delivered() {
        // ARRANGE: the orchestrator rejects the first delivery
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0007",
            &[("img.jpg.ref.json", r#"{"url":"https://cdn.example.com/img.jpg"}"#)],
        );
        stub.callback_failures_left.store(1, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        // ACT
        let db = start_chunk(&config, "batch-7", "chunk-1", &["PI-0007"]);
        let payload = stub.wait_for_callback().await;

        // ASSERT: delivered on the second attempt, then cleaned up
        assert_eq!(payload.status, "success");
        assert_eq!(stub.callback_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(stub.callbacks.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(db.load_state().unwrap().is_none());
    }

    // ============================================================
    // TEST 10: Scenario: empty chunk completes immediately
    // ============================================================

    #[tokio::test]
    async fn test_scenario_empty_chunk_reports_success() {
        let (base_url, stub) = spawn_platform().await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        start_chunk(&config, "batch-8", "chunk-1", &[]);
        let payload = stub.wait_for_callback().await;

        assert_eq!(payload.status, "success");
        assert!(payload.results.is_empty());
        assert_eq!(payload.summary.total_refs, 0);
        assert!(stub.ocr_calls.lock().unwrap().is_empty());
    }

    // ============================================================
    // TEST 11: Registry: acceptance, live status, counter conservation
    // ============================================================

    #[tokio::test]
    async fn test_registry_flow_and_status_projection() {
        // ARRANGE: slow the provider down so the run is observable
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0008",
            &[
                ("a.jpg.ref.json", r#"{"url":"https://cdn.example.com/a.jpg"}"#),
                ("b.jpg.ref.json", r#"{"url":"https://cdn.example.com/b.jpg"}"#),
            ],
        );
        stub.ocr_delay_ms.store(80, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());
        let registry = WorkerRegistry::new(config);
        let request = ProcessRequest {
            batch_id: "batch-9".to_string(),
            chunk_id: "chunk-1".to_string(),
            pis: vec![PiRef { pi: "PI-0008".to_string() }],
        };

        // ASSERT: unknown before acceptance
        let before = registry.status("batch-9", "chunk-1").unwrap();
        assert_eq!(before.status, "not_found");

        // ACT: accept, then watch the projection while the chunk runs
        match registry.submit(&request).unwrap() {
            SubmitOutcome::Accepted { total_pis } => assert_eq!(total_pis, 1),
            SubmitOutcome::AlreadyProcessing { .. } => panic!("fresh chunk rejected"),
        }

        let mut saw_processing = false;
        for attempt in 0.. {
            assert!(attempt < 2000, "no callback delivered within 10s");
            if !stub.callbacks.lock().unwrap().is_empty() {
                break;
            }
            let snapshot = registry.status("batch-9", "chunk-1").unwrap();
            if snapshot.status == "processing" {
                saw_processing = true;
                if let Some(progress) = &snapshot.progress {
                    if progress.total_refs > 0 {
                        // Counter conservation holds at every observation
                        assert_eq!(
                            progress.completed
                                + progress.failed
                                + progress.skipped
                                + progress.pending,
                            progress.total_refs
                        );
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(saw_processing, "never observed the chunk in flight");

        // ASSERT: after cleanup the chunk is unknown again
        tokio::time::sleep(Duration::from_millis(150)).await;
        let after = registry.status("batch-9", "chunk-1").unwrap();
        assert_eq!(after.status, "not_found");
    }

    // ============================================================
    // TEST 12: Registry: in-flight chunks reject resubmission
    // ============================================================

    #[tokio::test]
    async fn test_registry_rejects_resubmission_in_flight() {
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0009",
            &[("a.jpg.ref.json", r#"{"url":"https://cdn.example.com/a.jpg"}"#)],
        );
        stub.ocr_delay_ms.store(200, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());
        let registry = WorkerRegistry::new(config);
        let request = ProcessRequest {
            batch_id: "batch-10".to_string(),
            chunk_id: "chunk-1".to_string(),
            pis: vec![PiRef { pi: "PI-0009".to_string() }],
        };

        assert!(matches!(
            registry.submit(&request).unwrap(),
            SubmitOutcome::Accepted { .. }
        ));

        // Immediate resubmission hits non-terminal state
        match registry.submit(&request).unwrap() {
            SubmitOutcome::AlreadyProcessing { phase } => assert!(!phase.is_terminal()),
            SubmitOutcome::Accepted { .. } => panic!("in-flight chunk accepted twice"),
        }

        // After completion the same chunk can be accepted again
        stub.wait_for_callback().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            registry.submit(&request).unwrap(),
            SubmitOutcome::Accepted { .. }
        ));
    }

    // ============================================================
    // TEST 13: Scenario: transient failures exhaust the per-ref budget
    // ============================================================

    #[tokio::test]
    async fn test_scenario_transient_retries_exhausted() {
        // ARRANGE: the provider keeps failing with a retryable error
        let (base_url, stub) = spawn_platform().await;
        stub.add_entity(
            "PI-0010",
            &[("flaky.jpg.ref.json", r#"{"url":"https://cdn.example.com/flaky.jpg"}"#)],
        );
        for _ in 0..10 {
            stub.script_ocr(
                "https://cdn.example.com/flaky.jpg",
                OcrReply::Fault(500, "internal server error".to_string()),
            );
        }
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&base_url, dir.path());

        // ACT
        start_chunk(&config, "batch-11", "chunk-1", &["PI-0010"]);
        let payload = stub.wait_for_callback().await;

        // ASSERT: budget of 3 transient attempts, then terminal failure
        assert_eq!(stub.ocr_calls.lock().unwrap().len(), 3);
        assert_eq!(payload.status, "error");
        let result = &payload.results[0];
        assert_eq!(result.status, "error");
        assert_eq!(result.refs_failed, 1);
        // Nothing to publish, so the entity never moved
        assert_eq!(stub.entities.lock().unwrap().get("PI-0010").unwrap().ver, 1);
    }
}
