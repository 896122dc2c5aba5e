// fundline-server/tests/admin_routes.rs
// ============================================================================
// Module: Admin Route Tests
// Description: Route-level behavior of the admin surface.
// Purpose: Validate source CRUD, the 409 similarity guard, flags, and errors.
// ============================================================================

//! Route tests via `tower::ServiceExt::oneshot` over the in-memory
//! datastore and stub collaborators: create/read sources, near-duplicate
//! conflicts, the global force flag, run lookups, and structured errors.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use fundline_core::InMemoryDatastore;
use fundline_core::ManualClock;
use fundline_core::PipelineConfig;
use fundline_core::PipelineCoordinator;
use fundline_core::PipelineParts;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::Timestamp;
use fundline_core::interfaces::AnalysisAgent;
use fundline_core::interfaces::AnalysisError;
use fundline_core::interfaces::AnalysisOutput;
use fundline_core::interfaces::AnalyzedOpportunity;
use fundline_core::interfaces::AnalyzerError;
use fundline_core::interfaces::DataExtractor;
use fundline_core::interfaces::ExtractError;
use fundline_core::interfaces::ExtractionOutput;
use fundline_core::interfaces::FilterError;
use fundline_core::interfaces::FilterOutput;
use fundline_core::interfaces::OpportunityFilter;
use fundline_core::interfaces::SourceAnalysis;
use fundline_core::interfaces::SourceAnalyzer;
use fundline_core::interfaces::StorageAgent;
use fundline_core::interfaces::StorageAgentError;
use fundline_core::interfaces::StorageOutcome;
use fundline_core::interfaces::WorkflowKind;
use fundline_core::runtime::NoWaiter;
use fundline_server::AdminServerConfig;
use fundline_server::AppState;
use fundline_server::NoopAuditSink;
use fundline_server::NoopMetrics;
use fundline_server::admin_router;
use http_body_util::BodyExt;
use serde_json::Value;
use serde_json::json;
use tower::ServiceExt;

// ============================================================================
// SECTION: Stub Collaborators
// ============================================================================

/// Analyzer returning a fixed analysis.
struct StubAnalyzer;

impl SourceAnalyzer for StubAnalyzer {
    fn analyze(
        &self,
        _source: &Source,
        _configuration: &SourceConfiguration,
    ) -> Result<SourceAnalysis, AnalyzerError> {
        Ok(SourceAnalysis {
            endpoint: "https://api.example.test/v1".to_string(),
            workflow: WorkflowKind::SinglePass,
            confidence: 0.9,
            token_usage: 0,
            api_calls: 0,
            execution_time_ms: 0,
        })
    }
}

/// Extractor returning an empty batch.
struct EmptyExtractor;

impl DataExtractor for EmptyExtractor {
    fn extract(
        &self,
        _source: &Source,
        _configuration: &SourceConfiguration,
        _analysis: &SourceAnalysis,
    ) -> Result<ExtractionOutput, ExtractError> {
        Ok(ExtractionOutput::default())
    }
}

/// Analysis agent passing records through unscored.
struct PassAnalysis;

impl AnalysisAgent for PassAnalysis {
    fn enhance(
        &self,
        _new_opportunities: &[fundline_core::ExtractedOpportunity],
        _source: &Source,
    ) -> Result<AnalysisOutput, AnalysisError> {
        Ok(AnalysisOutput::default())
    }
}

/// Filter passing everything through.
struct PassFilter;

impl OpportunityFilter for PassFilter {
    fn filter(&self, enhanced: Vec<AnalyzedOpportunity>) -> Result<FilterOutput, FilterError> {
        let included = enhanced.len() as u64;
        Ok(FilterOutput {
            included_opportunities: enhanced,
            metrics: fundline_core::interfaces::FilterMetrics {
                execution_time_ms: 0,
                included,
                excluded: 0,
            },
        })
    }
}

/// Storage agent that never writes.
struct NoStorage;

impl StorageAgent for NoStorage {
    fn store(
        &self,
        _included: &[AnalyzedOpportunity],
        _source: &Source,
        _force_full_reprocessing: bool,
    ) -> Result<StorageOutcome, StorageAgentError> {
        Ok(StorageOutcome::default())
    }
}

// ============================================================================
// SECTION: Harness
// ============================================================================

/// Builds the router over a fresh in-memory datastore.
fn router() -> (Router, InMemoryDatastore) {
    let store = InMemoryDatastore::new();
    let clock = ManualClock::starting_at(Timestamp::from_unix_millis(1_700_000_000_000));
    let parts = PipelineParts {
        store: Arc::new(store.clone()),
        analyzer: Arc::new(StubAnalyzer),
        extractor: Arc::new(EmptyExtractor),
        analysis: Arc::new(PassAnalysis),
        filter: Arc::new(PassFilter),
        storage: Arc::new(NoStorage),
        clock: Arc::new(clock.clone()),
        waiter: Arc::new(NoWaiter),
    };
    let coordinator = PipelineCoordinator::new(parts, PipelineConfig::default());
    let state = AppState {
        datastore: Arc::new(store.clone()),
        coordinator: Arc::new(coordinator),
        clock: Arc::new(clock),
        metrics: Arc::new(NoopMetrics),
        audit: Arc::new(NoopAuditSink),
        config: Arc::new(AdminServerConfig::default()),
    };
    (admin_router(state), store)
}

/// A valid source-create body.
fn source_body(name: &str, organization: &str) -> Value {
    json!({
        "name": name,
        "organization": organization,
        "type": "state",
        "url": "https://api.example.test",
        "update_frequency": "daily",
        "handler_type": "standard",
        "active": true,
        "configurations": {}
    })
}

/// Sends one JSON request and returns status plus parsed body.
async fn send(router: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(value) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => Request::builder().method(method).uri(uri).body(Body::empty()).unwrap(),
    };
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

// ============================================================================
// SECTION: Health and Sources
// ============================================================================

#[tokio::test]
async fn health_reports_readiness() {
    let (router, _store) = router();
    let (status, body) = send(router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_read_and_delete_a_source() {
    let (router, _store) = router();
    let (status, body) = send(
        router.clone(),
        "POST",
        "/sources",
        Some(source_body("State Energy Grants", "Energy Office")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(router.clone(), "GET", &format!("/sources/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"]["name"], "State Energy Grants");

    let (status, _body) =
        send(router.clone(), "DELETE", &format!("/sources/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _body) = send(router, "GET", &format!("/sources/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn near_duplicate_sources_conflict() {
    let (router, _store) = router();
    let (status, _body) = send(
        router.clone(),
        "POST",
        "/sources",
        Some(source_body("State Energy Grants", "Energy Office")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        router.clone(),
        "POST",
        "/sources",
        Some(source_body("State Energy Grants", "The Energy Office")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "error");

    // A clearly different identity is accepted.
    let (status, _body) = send(
        router,
        "POST",
        "/sources",
        Some(source_body("Municipal Water Rebates", "Public Works")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn malformed_bodies_and_ids_are_bad_requests() {
    let (router, _store) = router();
    let mut body = source_body("Grants", "Office");
    body["url"] = json!("not a url");
    let (status, payload) = send(router.clone(), "POST", "/sources", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["status"], "error");

    let (status, _payload) = send(router, "GET", "/sources/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// SECTION: Processing and Runs
// ============================================================================

#[tokio::test]
async fn process_enqueues_and_returns_the_run_id() {
    let (router, _store) = router();
    let (status, body) = send(
        router.clone(),
        "POST",
        "/sources",
        Some(source_body("State Energy Grants", "Energy Office")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) =
        send(router.clone(), "POST", &format!("/sources/{id}/process"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["run_id"].as_str().is_some());

    let (status, _body) = send(
        router,
        "POST",
        &format!("/sources/{}/process", fundline_core::SourceId::generate()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_runs_are_not_found() {
    let (router, _store) = router();
    let (status, _body) = send(
        router.clone(),
        "GET",
        &format!("/runs/{}", fundline_core::RunId::generate()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _body) = send(router, "GET", "/runs/nope", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// SECTION: System Config
// ============================================================================

#[tokio::test]
async fn global_force_flag_round_trips() {
    let (router, _store) = router();
    let path = "/system-config/global_force_full_reprocessing";
    let (status, body) = send(router.clone(), "GET", path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], false);

    let (status, body) =
        send(router.clone(), "PUT", path, Some(json!({ "value": true }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], true);

    let (status, body) = send(router.clone(), "GET", path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], true);

    let (status, _body) = send(router, "PUT", path, Some(json!({ "value": "yes" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
