// fundline-server/src/server.rs
// ============================================================================
// Module: Admin Server
// Description: Admin HTTP surface for sources, runs, and system config.
// Purpose: Expose the pipeline over a minimal JSON API with structured errors.
// Dependencies: fundline-core, fundline-config, axum, tokio
// ============================================================================

//! ## Overview
//! The admin server exposes source CRUD, run enqueueing, run inspection,
//! raw-response lookup, and the global force-reprocessing flag. Pipeline
//! work runs on the blocking pool; enqueue endpoints answer 202 with the
//! run identifier before the run finishes. Every error body is structured
//! as `{status, pipeline, error, failedStage?, runId?}`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use fundline_config::SourceRuleError;
use fundline_config::validate_source;
use fundline_core::AuthDescriptor;
use fundline_core::Datastore;
use fundline_core::HandlerType;
use fundline_core::PipelineCoordinator;
use fundline_core::ProcessOptions;
use fundline_core::ProcessOutcome;
use fundline_core::RunId;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::SourceId;
use fundline_core::SourceType;
use fundline_core::UpdateCadence;
use fundline_core::runtime::GLOBAL_FORCE_FLAG_KEY;
use fundline_core::runtime::cleanup_orphaned_runs;
use fundline_core::time::Clock;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::similarity::identity_similarity;
use crate::similarity::identity_text;
use crate::telemetry::AuditEvent;
use crate::telemetry::AuditSink;
use crate::telemetry::RequestOutcome;
use crate::telemetry::ServerMetrics;

// ============================================================================
// SECTION: Server Configuration
// ============================================================================

/// Admin server configuration.
///
/// # Invariants
/// - `similarity_threshold` lies in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AdminServerConfig {
    /// Pipeline version tag echoed in error bodies.
    pub pipeline_version: String,
    /// Source-similarity threshold for the create guard.
    pub similarity_threshold: f64,
    /// Orphan-cleanup timeout in milliseconds.
    pub orphan_timeout_ms: u64,
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self {
            pipeline_version: "v2".to_string(),
            similarity_threshold: 0.85,
            orphan_timeout_ms: 1_800_000,
        }
    }
}

// ============================================================================
// SECTION: Application State
// ============================================================================

/// Shared state behind every admin handler.
#[derive(Clone)]
pub struct AppState {
    /// Datastore for all admin reads and writes.
    pub datastore: Arc<dyn Datastore>,
    /// Coordinator executing enqueued runs.
    pub coordinator: Arc<PipelineCoordinator>,
    /// Clock for stamps.
    pub clock: Arc<dyn Clock>,
    /// Metrics sink.
    pub metrics: Arc<dyn ServerMetrics>,
    /// Audit sink.
    pub audit: Arc<dyn AuditSink>,
    /// Server configuration.
    pub config: Arc<AdminServerConfig>,
}

// ============================================================================
// SECTION: Router
// ============================================================================

/// Builds the admin router over the shared state.
#[must_use]
pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sources", get(list_sources).post(create_source))
        .route(
            "/sources/{id}",
            get(get_source).put(update_source).delete(delete_source),
        )
        .route("/sources/{id}/process", post(process_source))
        .route("/process", post(process_next_due))
        .route("/runs/{id}", get(get_run))
        .route("/raw-responses/{id}", get(get_raw_response))
        .route(
            "/system-config/global_force_full_reprocessing",
            get(get_global_force).put(put_global_force),
        )
        .with_state(state)
}

/// Serves the admin router on the given address until the process exits.
///
/// # Errors
///
/// Returns an I/O error message when binding fails.
pub async fn serve(state: AppState, bind_addr: SocketAddr) -> Result<(), String> {
    let router = admin_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|err| format!("admin server bind failed: {err}"))?;
    axum::serve(listener, router)
        .await
        .map_err(|err| format!("admin server terminated: {err}"))
}

// ============================================================================
// SECTION: Request Bodies
// ============================================================================

/// Source create/update body.
///
/// # Invariants
/// - `auth_details` is interpreted per `auth_type`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceBody {
    /// Display name.
    pub name: String,
    /// Owning organization.
    pub organization: String,
    /// Organization class.
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Base URL.
    pub url: String,
    /// Optional API endpoint.
    #[serde(default)]
    pub api_endpoint: Option<String>,
    /// Optional documentation link.
    #[serde(default)]
    pub api_documentation_url: Option<String>,
    /// Auth type tag: none, apikey, basic, or bearer.
    #[serde(default)]
    pub auth_type: Option<String>,
    /// Auth credential fields, per auth type.
    #[serde(default)]
    pub auth_details: BTreeMap<String, Value>,
    /// Update cadence tag.
    pub update_frequency: UpdateCadence,
    /// Handler family.
    pub handler_type: HandlerType,
    /// Free-form operator notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Whether the source participates in scheduling.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Configuration bundle.
    #[serde(default)]
    pub configurations: SourceConfiguration,
}

/// Sources are active unless the body says otherwise.
const fn default_active() -> bool {
    true
}

/// Structured error body shared by all handlers.
#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    /// Always `error`.
    status: &'static str,
    /// Pipeline version tag.
    pipeline: String,
    /// Failure description.
    error: String,
}

/// Handler error carrying an HTTP status and a structured body.
struct ApiError {
    /// HTTP status code.
    status: StatusCode,
    /// Structured body.
    body: ErrorBody,
}

impl ApiError {
    /// Creates an error response.
    fn new(status: StatusCode, pipeline: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                status: "error",
                pipeline: pipeline.to_string(),
                error: error.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

/// GET /health — datastore readiness probe.
async fn health(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let response = match state.datastore.readiness() {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(err) => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            &state.config.pipeline_version,
            err.to_string(),
        )
        .into_response(),
    };
    record(&state, "/health", &response, started);
    response
}

/// GET /sources — source summaries.
async fn list_sources(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let response = match state.datastore.list_sources() {
        Ok(sources) => {
            let summaries: Vec<Value> = sources.iter().map(source_summary).collect();
            (StatusCode::OK, Json(json!({ "sources": summaries }))).into_response()
        }
        Err(err) => storage_error(&state, err.to_string()).into_response(),
    };
    record(&state, "/sources", &response, started);
    response
}

/// POST /sources — create a source; 409 on near-duplicates.
async fn create_source(
    State(state): State<AppState>,
    Json(body): Json<SourceBody>,
) -> Response {
    let started = Instant::now();
    let response = create_source_inner(&state, body).into_response();
    record(&state, "/sources", &response, started);
    response
}

/// Create-source body handling, separated for error mapping.
fn create_source_inner(state: &AppState, body: SourceBody) -> Result<Response, ApiError> {
    let pipeline = &state.config.pipeline_version;
    let now = state.clock.now();
    let source = build_source(&body, SourceId::generate(), now)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, pipeline, err))?;
    validate_source(&source, &body.configurations).map_err(|err: SourceRuleError| {
        ApiError::new(StatusCode::BAD_REQUEST, pipeline, err.to_string())
    })?;

    let existing = state
        .datastore
        .list_sources()
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, pipeline, err.to_string()))?;
    let identity = identity_text(&source.name, &source.organization);
    for candidate in &existing {
        let other = identity_text(&candidate.name, &candidate.organization);
        let similarity = identity_similarity(&identity, &other);
        if similarity >= state.config.similarity_threshold {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                pipeline,
                format!(
                    "source too similar to {} (similarity {similarity:.2})",
                    candidate.source_id
                ),
            ));
        }
    }

    state
        .datastore
        .insert_source(&source, &body.configurations)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, pipeline, err.to_string()))?;
    state.audit.record(&AuditEvent::SourceCreated {
        source_id: source.source_id.clone(),
    });
    Ok((StatusCode::CREATED, Json(json!({ "id": source.source_id }))).into_response())
}

/// GET /sources/{id} — source detail with configuration.
async fn get_source(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let started = Instant::now();
    let response = (|| -> Result<Response, ApiError> {
        let source_id = parse_source_id(&state, &id)?;
        let source = state
            .datastore
            .get_source(&source_id)
            .map_err(|err| storage_error(&state, err.to_string()))?
            .ok_or_else(|| not_found(&state, "source"))?;
        let configuration = state
            .datastore
            .get_configuration(&source_id)
            .map_err(|err| storage_error(&state, err.to_string()))?
            .unwrap_or_default();
        Ok((
            StatusCode::OK,
            Json(json!({ "source": source, "configurations": configuration })),
        )
            .into_response())
    })()
    .into_response();
    record(&state, "/sources/{id}", &response, started);
    response
}

/// PUT /sources/{id} — replace a source and its configuration.
async fn update_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SourceBody>,
) -> Response {
    let started = Instant::now();
    let response = (|| -> Result<Response, ApiError> {
        let pipeline = &state.config.pipeline_version;
        let source_id = parse_source_id(&state, &id)?;
        let existing = state
            .datastore
            .get_source(&source_id)
            .map_err(|err| storage_error(&state, err.to_string()))?
            .ok_or_else(|| not_found(&state, "source"))?;
        let mut source = build_source(&body, source_id, existing.created_at)
            .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, pipeline, err))?;
        source.last_checked = existing.last_checked;
        source.force_full_reprocessing = existing.force_full_reprocessing;
        source.updated_at = state.clock.now();
        validate_source(&source, &body.configurations).map_err(|err| {
            ApiError::new(StatusCode::BAD_REQUEST, pipeline, err.to_string())
        })?;
        state
            .datastore
            .update_source(&source, &body.configurations)
            .map_err(|err| storage_error(&state, err.to_string()))?;
        Ok((StatusCode::OK, Json(json!({ "id": source.source_id }))).into_response())
    })()
    .into_response();
    record(&state, "/sources/{id}", &response, started);
    response
}

/// DELETE /sources/{id}.
async fn delete_source(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let started = Instant::now();
    let response = (|| -> Result<Response, ApiError> {
        let source_id = parse_source_id(&state, &id)?;
        state
            .datastore
            .delete_source(&source_id)
            .map_err(|err| storage_error(&state, err.to_string()))?;
        state.audit.record(&AuditEvent::SourceDeleted {
            source_id,
        });
        Ok(StatusCode::NO_CONTENT.into_response())
    })()
    .into_response();
    record(&state, "/sources/{id}", &response, started);
    response
}

/// POST /sources/{id}/process — enqueue a run; 202 with the run id.
async fn process_source(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let started = Instant::now();
    let response = (|| -> Result<Response, ApiError> {
        let source_id = parse_source_id(&state, &id)?;
        state
            .datastore
            .get_source(&source_id)
            .map_err(|err| storage_error(&state, err.to_string()))?
            .ok_or_else(|| not_found(&state, "source"))?;
        let run_id = enqueue_run(&state, source_id);
        Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))).into_response())
    })()
    .into_response();
    record(&state, "/sources/{id}/process", &response, started);
    response
}

/// POST /process — sweep orphans, then enqueue the next-due source.
async fn process_next_due(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let response = (|| -> Result<Response, ApiError> {
        let now = state.clock.now();
        let _ = cleanup_orphaned_runs(state.datastore.as_ref(), now, state.config.orphan_timeout_ms);
        let due = state
            .datastore
            .next_due_source(now)
            .map_err(|err| storage_error(&state, err.to_string()))?;
        match due {
            None => Ok((StatusCode::OK, Json(json!({ "status": "idle" }))).into_response()),
            Some(source) => {
                let run_id = enqueue_run(&state, source.source_id.clone());
                Ok((
                    StatusCode::ACCEPTED,
                    Json(json!({ "run_id": run_id, "source_id": source.source_id })),
                )
                    .into_response())
            }
        }
    })()
    .into_response();
    record(&state, "/process", &response, started);
    response
}

/// GET /runs/{id} — run detail with stages, paths, and detection session.
async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let started = Instant::now();
    let response = (|| -> Result<Response, ApiError> {
        let run_id = RunId::parse(&id).map_err(|_| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                &state.config.pipeline_version,
                "run id is not a well-formed uuid",
            )
        })?;
        let run = state
            .datastore
            .load_run(&run_id)
            .map_err(|err| storage_error(&state, err.to_string()))?
            .ok_or_else(|| not_found(&state, "run"))?;
        let stages = state
            .datastore
            .load_stages(&run_id)
            .map_err(|err| storage_error(&state, err.to_string()))?;
        let paths = state
            .datastore
            .load_paths(&run_id)
            .map_err(|err| storage_error(&state, err.to_string()))?;
        let session = state
            .datastore
            .load_detection_session(&run_id)
            .map_err(|err| storage_error(&state, err.to_string()))?;
        Ok((
            StatusCode::OK,
            Json(json!({
                "run": run,
                "stages": stages,
                "opportunity_paths": paths,
                "duplicate_detection_session": session,
            })),
        )
            .into_response())
    })()
    .into_response();
    record(&state, "/runs/{id}", &response, started);
    response
}

/// GET /raw-responses/{id}.
async fn get_raw_response(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let started = Instant::now();
    let response = (|| -> Result<Response, ApiError> {
        let raw = state
            .datastore
            .load_raw_response(&id)
            .map_err(|err| storage_error(&state, err.to_string()))?
            .ok_or_else(|| not_found(&state, "raw response"))?;
        Ok((StatusCode::OK, Json(json!(raw))).into_response())
    })()
    .into_response();
    record(&state, "/raw-responses/{id}", &response, started);
    response
}

/// GET /system-config/global_force_full_reprocessing.
async fn get_global_force(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let response = match state.datastore.get_flag(GLOBAL_FORCE_FLAG_KEY) {
        Ok(value) => (
            StatusCode::OK,
            Json(json!({ "key": GLOBAL_FORCE_FLAG_KEY, "value": value.unwrap_or(false) })),
        )
            .into_response(),
        Err(err) => storage_error(&state, err.to_string()).into_response(),
    };
    record(&state, "/system-config", &response, started);
    response
}

/// PUT /system-config/global_force_full_reprocessing.
async fn put_global_force(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let started = Instant::now();
    let response = (|| -> Result<Response, ApiError> {
        let value = body
            .get("value")
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    &state.config.pipeline_version,
                    "body must carry a boolean value field",
                )
            })?;
        state
            .datastore
            .set_flag(GLOBAL_FORCE_FLAG_KEY, value)
            .map_err(|err| storage_error(&state, err.to_string()))?;
        Ok((
            StatusCode::OK,
            Json(json!({ "key": GLOBAL_FORCE_FLAG_KEY, "value": value })),
        )
            .into_response())
    })()
    .into_response();
    record(&state, "/system-config", &response, started);
    response
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Spawns the coordinator on the blocking pool and returns the run id.
fn enqueue_run(state: &AppState, source_id: SourceId) -> RunId {
    let run_id = RunId::generate();
    state.audit.record(&AuditEvent::RunEnqueued {
        source_id: source_id.clone(),
        run_id: run_id.clone(),
    });
    let coordinator = Arc::clone(&state.coordinator);
    let audit = Arc::clone(&state.audit);
    let options = ProcessOptions {
        run_id: Some(run_id.clone()),
        cancel: None,
    };
    let enqueued_run_id = run_id.clone();
    let _ = tokio::task::spawn_blocking(move || {
        let outcome = coordinator.process_source(&source_id, &options);
        match outcome {
            ProcessOutcome::Completed(_) => audit.record(&AuditEvent::RunCompleted {
                run_id: enqueued_run_id,
            }),
            ProcessOutcome::Failed(failure) => audit.record(&AuditEvent::RunFailed {
                run_id: enqueued_run_id,
                category: failure.category.to_string(),
            }),
        }
    });
    run_id
}

/// Builds a source row from an admin body.
fn build_source(
    body: &SourceBody,
    source_id: SourceId,
    created_at: fundline_core::Timestamp,
) -> Result<Source, String> {
    Ok(Source {
        source_id,
        name: body.name.clone(),
        organization: body.organization.clone(),
        source_type: body.source_type,
        url: body.url.clone(),
        api_endpoint: body.api_endpoint.clone(),
        api_documentation_url: body.api_documentation_url.clone(),
        auth: build_auth(body)?,
        update_frequency: body.update_frequency,
        handler_type: body.handler_type,
        notes: body.notes.clone(),
        active: body.active,
        force_full_reprocessing: false,
        last_checked: None,
        created_at,
        updated_at: created_at,
    })
}

/// Builds the auth descriptor from the body's type tag and details.
fn build_auth(body: &SourceBody) -> Result<AuthDescriptor, String> {
    let detail = |key: &str| -> Option<String> {
        body.auth_details.get(key).and_then(Value::as_str).map(str::to_string)
    };
    match body.auth_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("none" | "") => Ok(AuthDescriptor::None),
        Some("apikey" | "api_key") => Ok(AuthDescriptor::ApiKey {
            key_name: detail("key_name").ok_or("auth_details.key_name is required")?,
            key_value: detail("key_value").ok_or("auth_details.key_value is required")?,
            location: match detail("location").as_deref() {
                Some("query") => fundline_core::ApiKeyLocation::Query,
                _ => fundline_core::ApiKeyLocation::Header,
            },
        }),
        Some("basic") => Ok(AuthDescriptor::Basic {
            username: detail("username").ok_or("auth_details.username is required")?,
            password: detail("password").unwrap_or_default(),
        }),
        Some("bearer") => Ok(AuthDescriptor::Bearer {
            token: detail("token").ok_or("auth_details.token is required")?,
        }),
        Some(other) => Err(format!("unknown auth type: {other}")),
    }
}

/// Summary shape for source listings.
fn source_summary(source: &Source) -> Value {
    json!({
        "id": source.source_id,
        "name": source.name,
        "organization": source.organization,
        "type": source.source_type,
        "active": source.active,
        "last_checked": source.last_checked,
        "force_full_reprocessing": source.force_full_reprocessing,
    })
}

/// Parses a source id path segment.
fn parse_source_id(state: &AppState, id: &str) -> Result<SourceId, ApiError> {
    SourceId::parse(id).map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            &state.config.pipeline_version,
            "source id is not a well-formed uuid",
        )
    })
}

/// 404 error body.
fn not_found(state: &AppState, what: &str) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        &state.config.pipeline_version,
        format!("{what} not found"),
    )
}

/// 500 error body for datastore failures.
fn storage_error(state: &AppState, message: String) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, &state.config.pipeline_version, message)
}

/// Records request metrics for a finished response.
fn record(state: &AppState, route: &str, response: &Response, started: Instant) {
    let outcome = if response.status().is_success() || response.status() == StatusCode::ACCEPTED {
        RequestOutcome::Ok
    } else {
        RequestOutcome::Error
    };
    let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    state.metrics.record_request(route, outcome, latency);
}

