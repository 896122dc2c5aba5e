// fundline-agents/src/http.rs
// ============================================================================
// Module: HTTP Fetch Agent
// Description: Data extractor for declaratively configured HTTP APIs.
// Purpose: Fetch, paginate, fan out detail calls, and map records with strict limits.
// Dependencies: fundline-core, reqwest, serde_json, url, crate::{mapping, path}
// ============================================================================

//! ## Overview
//! The fetch agent turns a source configuration into bounded outbound
//! requests: auth placed per descriptor, pagination driven by the scheme
//! tag, optional per-item detail calls, and response mapping into extracted
//! opportunities. Redirects are disabled and response bodies are byte-capped
//! to preserve fail-closed behavior.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use fundline_core::ApiKeyLocation;
use fundline_core::AuthDescriptor;
use fundline_core::ExtractedOpportunity;
use fundline_core::HttpMethod;
use fundline_core::PaginationConfig;
use fundline_core::PaginationScheme;
use fundline_core::ParamPlacement;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::WorkflowKind;
use fundline_core::interfaces::DataExtractor;
use fundline_core::interfaces::ExtractError;
use fundline_core::interfaces::ExtractionMetrics;
use fundline_core::interfaces::ExtractionOutput;
use fundline_core::interfaces::RawResponseStore;
use fundline_core::interfaces::SourceAnalysis;
use fundline_core::time::Clock;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::blocking::RequestBuilder;
use reqwest::redirect::Policy;
use serde_json::Map;
use serde_json::Value;

use crate::mapping::map_record;
use crate::mapping::merge_records;
use crate::path::resolve;
use crate::path::resolve_text;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Configuration for the HTTP fetch agent.
///
/// # Invariants
/// - `allow_http = false` blocks cleartext `http://` upstreams.
/// - `max_response_bytes` is a hard upper bound on every response body.
/// - `timeout_ms` applies to the full request lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFetchConfig {
    /// Allow cleartext HTTP upstreams.
    pub allow_http: bool,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum response size allowed, in bytes.
    pub max_response_bytes: usize,
    /// User agent string for outbound requests.
    pub user_agent: String,
    /// Whether first-page raw responses are captured by reference.
    pub capture_raw_responses: bool,
}

impl Default for HttpFetchConfig {
    fn default() -> Self {
        Self {
            allow_http: false,
            timeout_ms: 30_000,
            max_response_bytes: 8 * 1024 * 1024,
            user_agent: "fundline/0.1".to_string(),
            capture_raw_responses: true,
        }
    }
}

// ============================================================================
// SECTION: Fetch Agent
// ============================================================================

/// Data extractor for declaratively configured HTTP APIs.
///
/// # Invariants
/// - Redirects are not followed.
/// - Responses exceeding configured limits fail closed.
pub struct HttpFetchAgent {
    /// Agent configuration, including limits.
    config: HttpFetchConfig,
    /// HTTP client used for outbound requests.
    client: Client,
    /// Optional raw-response sink for first-page capture.
    raw_store: Option<Arc<dyn RawResponseStore>>,
    /// Clock for capture stamps.
    clock: Arc<dyn Clock>,
}

impl HttpFetchAgent {
    /// Creates a fetch agent with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] when the HTTP client cannot be created.
    pub fn new(
        config: HttpFetchConfig,
        raw_store: Option<Arc<dyn RawResponseStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .redirect(Policy::none())
            .build()
            .map_err(|_| ExtractError::Network("http client build failed".to_string()))?;
        Ok(Self {
            config,
            client,
            raw_store,
            clock,
        })
    }
}

impl DataExtractor for HttpFetchAgent {
    fn extract(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
        analysis: &SourceAnalysis,
    ) -> Result<ExtractionOutput, ExtractError> {
        let started = Instant::now();
        let endpoint = validate_endpoint(&analysis.endpoint, self.config.allow_http)?;
        let mut metrics = ExtractionMetrics::default();
        let mut opportunities: Vec<ExtractedOpportunity> = Vec::new();
        let mut raw_response_id = None;

        let mut page_index: u32 = 0;
        let mut cursor: Option<String> = None;
        let max_pages = configuration.pagination.as_ref().map_or(1, |p| p.max_pages.max(1));

        loop {
            let body = self.fetch_page(source, configuration, &endpoint, page_index, cursor.as_deref())?;
            metrics.api_calls += 1;
            if page_index == 0 && self.config.capture_raw_responses {
                raw_response_id = self.capture_raw(source, &body);
            }

            let records = page_records(&body, configuration)?;
            let page_len = records.len();
            metrics.total_found += as_u64(page_len);

            for record in &records {
                let merged = if needs_detail(analysis, configuration) {
                    self.fetch_detail(source, configuration, record, &mut metrics)?
                        .map_or_else(|| record.clone(), |detail| merge_records(record, &detail))
                } else {
                    record.clone()
                };
                let id_path = configuration.detail.as_ref().map(|d| d.id_field.as_str());
                opportunities.push(map_record(&merged, &configuration.response_mapping, id_path));
            }

            page_index += 1;
            if page_index >= max_pages || page_len == 0 {
                break;
            }
            match next_cursor(&body, configuration) {
                CursorState::NotCursorPaged => {
                    if configuration.pagination.is_none() {
                        break;
                    }
                }
                CursorState::Exhausted => break,
                CursorState::Next(value) => cursor = Some(value),
            }
        }

        metrics.total_retrieved = as_u64(opportunities.len());
        metrics.execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(ExtractionOutput {
            opportunities,
            raw_response_id,
            metrics,
        })
    }
}

impl HttpFetchAgent {
    /// Fetches one list page.
    fn fetch_page(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
        endpoint: &Url,
        page_index: u32,
        cursor: Option<&str>,
    ) -> Result<Value, ExtractError> {
        let mut url = endpoint.clone();
        let mut body_map: Map<String, Value> = configuration
            .request_body
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &configuration.query_params {
                pairs.append_pair(key, value);
            }
        }
        apply_pagination(&mut url, &mut body_map, configuration.pagination.as_ref(), page_index, cursor);
        apply_query_auth(&mut url, &source.auth);

        let method = configuration.request.method;
        let mut request = self.builder(method, url.clone());
        for (name, value) in &configuration.request.headers {
            request = request.header(name, value);
        }
        request = apply_header_auth(request, &source.auth);
        if matches!(method, HttpMethod::Post | HttpMethod::Put) && !body_map.is_empty() {
            request = request.json(&Value::Object(body_map));
        }

        let response = request
            .send()
            .map_err(|err| ExtractError::Network(format!("api fetch request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Http {
                status: status.as_u16(),
                message: format!("list request to {} rejected", redact_url(&url)),
            });
        }
        self.read_json(response)
    }

    /// Fetches one detail record for a list record, when configured.
    fn fetch_detail(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
        record: &Value,
        metrics: &mut ExtractionMetrics,
    ) -> Result<Option<Value>, ExtractError> {
        let Some(detail) = &configuration.detail else {
            return Ok(None);
        };
        let Some(record_id) = resolve_text(record, &detail.id_field) else {
            return Ok(None);
        };
        let mut url = validate_endpoint(&detail.endpoint, self.config.allow_http)?;
        url.query_pairs_mut().append_pair(&detail.id_param, &record_id);
        apply_query_auth(&mut url, &source.auth);

        let mut request = self.builder(detail.method, url.clone());
        for (name, value) in &detail.headers {
            request = request.header(name, value);
        }
        request = apply_header_auth(request, &source.auth);

        let response = request
            .send()
            .map_err(|err| ExtractError::Network(format!("detail fetch failed: {err}")))?;
        metrics.api_calls += 1;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Http {
                status: status.as_u16(),
                message: format!("detail request for record {record_id} rejected"),
            });
        }
        let body = self.read_json(response)?;
        let payload = detail
            .response_data_path
            .as_deref()
            .and_then(|path| resolve(&body, path))
            .cloned()
            .unwrap_or(body);
        Ok(Some(payload))
    }

    /// Builds a request for a method and URL.
    fn builder(&self, method: HttpMethod, url: Url) -> RequestBuilder {
        match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        }
    }

    /// Reads a JSON body under the byte cap.
    fn read_json(&self, response: reqwest::blocking::Response) -> Result<Value, ExtractError> {
        let max_bytes = self.config.max_response_bytes;
        let expected = response.content_length();
        if let Some(length) = expected
            && length > as_u64(max_bytes)
        {
            return Err(ExtractError::TooLarge(format!("{length} bytes")));
        }
        let mut buf = Vec::new();
        let limit = as_u64(max_bytes).saturating_add(1);
        let mut handle = response.take(limit);
        handle
            .read_to_end(&mut buf)
            .map_err(|_| ExtractError::Network("failed to read api response".to_string()))?;
        if buf.len() > max_bytes {
            return Err(ExtractError::TooLarge(format!("over {max_bytes} bytes")));
        }
        serde_json::from_slice(&buf)
            .map_err(|err| ExtractError::Invalid(format!("response is not valid json: {err}")))
    }

    /// Stores the first-page raw response, when a sink is wired.
    fn capture_raw(&self, source: &Source, body: &Value) -> Option<String> {
        let store = self.raw_store.as_ref()?;
        store.store_raw_response(&source.source_id, body, self.clock.now()).ok()
    }
}

// ============================================================================
// SECTION: Pagination
// ============================================================================

/// Cursor advance outcome for one page.
enum CursorState {
    /// Source is not cursor-paginated.
    NotCursorPaged,
    /// No further cursor; stop.
    Exhausted,
    /// Next cursor value.
    Next(String),
}

/// Applies pagination parameters to the URL or body per placement.
fn apply_pagination(
    url: &mut Url,
    body_map: &mut Map<String, Value>,
    pagination: Option<&PaginationConfig>,
    page_index: u32,
    cursor: Option<&str>,
) {
    let Some(pagination) = pagination else {
        return;
    };
    let mut params: Vec<(String, String)> = vec![(
        pagination.limit_param.clone(),
        pagination.page_size.to_string(),
    )];
    match &pagination.scheme {
        PaginationScheme::Offset {
            offset_param,
        } => {
            let offset = u64::from(page_index) * u64::from(pagination.page_size);
            params.push((offset_param.clone(), offset.to_string()));
        }
        PaginationScheme::Page {
            page_param,
        } => {
            params.push((page_param.clone(), (page_index + 1).to_string()));
        }
        PaginationScheme::Cursor {
            cursor_param, ..
        } => {
            if let Some(cursor) = cursor {
                params.push((cursor_param.clone(), cursor.to_string()));
            }
        }
    }
    match pagination.placement {
        ParamPlacement::Query => {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(&key, &value);
            }
        }
        ParamPlacement::Body => {
            for (key, value) in params {
                body_map.insert(key, Value::String(value));
            }
        }
    }
}

/// Extracts the next cursor from a page body.
fn next_cursor(body: &Value, configuration: &SourceConfiguration) -> CursorState {
    let Some(PaginationConfig {
        scheme: PaginationScheme::Cursor {
            next_cursor_path, ..
        },
        ..
    }) = configuration.pagination.as_ref()
    else {
        return CursorState::NotCursorPaged;
    };
    resolve_text(body, next_cursor_path).map_or(CursorState::Exhausted, CursorState::Next)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Validates the endpoint URL scheme and shape.
fn validate_endpoint(endpoint: &str, allow_http: bool) -> Result<Url, ExtractError> {
    let url = Url::parse(endpoint.trim())
        .map_err(|_| ExtractError::Invalid(format!("invalid endpoint url: {endpoint}")))?;
    match url.scheme() {
        "https" => {}
        "http" if allow_http => {}
        other => {
            return Err(ExtractError::Invalid(format!("unsupported url scheme: {other}")));
        }
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ExtractError::Invalid("url credentials are not allowed".to_string()));
    }
    Ok(url)
}

/// Appends query-placed credentials to the request URL.
fn apply_query_auth(url: &mut Url, auth: &AuthDescriptor) {
    if let AuthDescriptor::ApiKey {
        key_name,
        key_value,
        location: ApiKeyLocation::Query,
    } = auth
    {
        url.query_pairs_mut().append_pair(key_name, key_value);
    }
}

/// Applies header-placed credentials to a request.
fn apply_header_auth(request: RequestBuilder, auth: &AuthDescriptor) -> RequestBuilder {
    match auth {
        AuthDescriptor::None
        | AuthDescriptor::ApiKey {
            location: ApiKeyLocation::Query,
            ..
        } => request,
        AuthDescriptor::ApiKey {
            key_name,
            key_value,
            location: ApiKeyLocation::Header,
        } => request.header(key_name, key_value),
        AuthDescriptor::Basic {
            username,
            password,
        } => request.basic_auth(username, Some(password)),
        AuthDescriptor::Bearer {
            token,
        } => request.bearer_auth(token),
    }
}

/// Locates the record array in a page body.
fn page_records(body: &Value, configuration: &SourceConfiguration) -> Result<Vec<Value>, ExtractError> {
    let located = configuration
        .response_mapping
        .data_path
        .as_deref()
        .map_or(Some(body), |path| resolve(body, path));
    match located {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Object(_)) | Some(Value::Null) => Ok(Vec::new()),
        Some(_) => Err(ExtractError::Invalid("record container is not an array".to_string())),
        None => Ok(Vec::new()),
    }
}

/// Whether this run needs the per-item detail fan-out.
fn needs_detail(analysis: &SourceAnalysis, configuration: &SourceConfiguration) -> bool {
    analysis.workflow == WorkflowKind::TwoStep && configuration.detail.is_some()
}

/// Renders a URL with its query stripped for error messages.
fn redact_url(url: &Url) -> String {
    let mut cleaned = url.clone();
    cleaned.set_query(None);
    cleaned.to_string()
}

/// Converts a usize counter to u64.
fn as_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
