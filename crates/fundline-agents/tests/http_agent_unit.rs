// fundline-agents/tests/http_agent_unit.rs
// ============================================================================
// Module: HTTP Fetch Agent Unit Tests
// Description: Pagination, auth placement, detail fan-out, and limits.
// Purpose: Validate the extractor against a local adversarial server.
// ============================================================================

//! Fetch-agent tests against a local `tiny_http` server: offset and cursor
//! pagination, query-placed API keys, detail merging, non-success statuses,
//! and the response byte cap.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use fundline_agents::HttpFetchAgent;
use fundline_agents::HttpFetchConfig;
use fundline_core::ApiKeyLocation;
use fundline_core::AuthDescriptor;
use fundline_core::CanonicalField;
use fundline_core::DetailConfig;
use fundline_core::HandlerType;
use fundline_core::HttpMethod;
use fundline_core::PaginationConfig;
use fundline_core::PaginationScheme;
use fundline_core::ParamPlacement;
use fundline_core::RequestConfig;
use fundline_core::ResponseMapping;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::SourceId;
use fundline_core::SourceType;
use fundline_core::SystemClock;
use fundline_core::Timestamp;
use fundline_core::UpdateCadence;
use fundline_core::interfaces::DataExtractor;
use fundline_core::interfaces::ExtractError;
use fundline_core::interfaces::SourceAnalysis;
use fundline_core::interfaces::WorkflowKind;
use tiny_http::Response;
use tiny_http::Server;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Fetch agent allowing cleartext HTTP for the local server.
fn local_agent() -> HttpFetchAgent {
    HttpFetchAgent::new(
        HttpFetchConfig {
            allow_http: true,
            timeout_ms: 5_000,
            max_response_bytes: 64 * 1024,
            user_agent: "fundline-test/0.1".to_string(),
            capture_raw_responses: false,
        },
        None,
        Arc::new(SystemClock),
    )
    .unwrap()
}

/// Source pointing at the local server.
fn local_source(endpoint: &str, auth: AuthDescriptor) -> Source {
    Source {
        source_id: SourceId::generate(),
        name: "Local Test API".to_string(),
        organization: "Test Org".to_string(),
        source_type: SourceType::State,
        url: endpoint.to_string(),
        api_endpoint: Some(endpoint.to_string()),
        api_documentation_url: None,
        auth,
        update_frequency: UpdateCadence::Daily,
        handler_type: HandlerType::Standard,
        notes: None,
        active: true,
        force_full_reprocessing: false,
        last_checked: None,
        created_at: Timestamp::from_unix_millis(0),
        updated_at: Timestamp::from_unix_millis(0),
    }
}

/// Analysis selecting the endpoint and workflow.
fn analysis(endpoint: &str, workflow: WorkflowKind) -> SourceAnalysis {
    SourceAnalysis {
        endpoint: endpoint.to_string(),
        workflow,
        confidence: 0.9,
        token_usage: 0,
        api_calls: 0,
        execution_time_ms: 0,
    }
}

/// Mapping with a data path and the three fields the tests assert on.
fn mapping() -> ResponseMapping {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), CanonicalField::Title);
    fields.insert("amounts.total".to_string(), CanonicalField::TotalFunding);
    fields.insert("link".to_string(), CanonicalField::Url);
    ResponseMapping {
        data_path: Some("data.items".to_string()),
        fields,
    }
}

// ============================================================================
// SECTION: Single Page
// ============================================================================

#[test]
fn maps_a_single_page_of_records() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}/opps", server.server_addr());
    let handle = thread::spawn(move || {
        let request = server.recv().unwrap();
        let body = serde_json::json!({
            "data": { "items": [
                { "id": "A1", "title": " Solar Grant ", "amounts": { "total": "$500,000" },
                  "link": "https://grants.example.test/a1" },
                { "id": "A2", "title": "Wind Grant", "amounts": { "total": 10_000 } }
            ] }
        });
        request.respond(Response::from_string(body.to_string())).unwrap();
    });

    let agent = local_agent();
    let source = local_source(&endpoint, AuthDescriptor::None);
    let configuration = SourceConfiguration {
        response_mapping: mapping(),
        ..SourceConfiguration::default()
    };
    let output = agent
        .extract(&source, &configuration, &analysis(&endpoint, WorkflowKind::SinglePass))
        .unwrap();
    handle.join().unwrap();

    assert_eq!(output.opportunities.len(), 2);
    assert_eq!(output.metrics.total_retrieved, 2);
    assert_eq!(output.metrics.api_calls, 1);
    let first = &output.opportunities[0];
    assert_eq!(first.api_opportunity_id.as_deref(), Some("A1"));
    assert_eq!(first.title.as_deref(), Some("Solar Grant"));
    assert_eq!(first.total_funding, Some(500_000.0));
    assert_eq!(first.url.as_deref(), Some("https://grants.example.test/a1"));
}

// ============================================================================
// SECTION: Pagination
// ============================================================================

#[test]
fn offset_pagination_walks_pages_until_empty() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}/opps", server.server_addr());
    let handle = thread::spawn(move || {
        let mut seen_offsets = Vec::new();
        for page in 0..3 {
            let request = server.recv().unwrap();
            let url = request.url().to_string();
            seen_offsets.push(url);
            let items = match page {
                0 => serde_json::json!([{ "id": "A1", "title": "One" },
                                        { "id": "A2", "title": "Two" }]),
                1 => serde_json::json!([{ "id": "A3", "title": "Three" }]),
                _ => serde_json::json!([]),
            };
            let body = serde_json::json!({ "data": { "items": items } });
            request.respond(Response::from_string(body.to_string())).unwrap();
        }
        seen_offsets
    });

    let agent = local_agent();
    let source = local_source(&endpoint, AuthDescriptor::None);
    let configuration = SourceConfiguration {
        response_mapping: mapping(),
        pagination: Some(PaginationConfig {
            scheme: PaginationScheme::Offset {
                offset_param: "offset".to_string(),
            },
            limit_param: "limit".to_string(),
            page_size: 2,
            max_pages: 5,
            placement: ParamPlacement::Query,
        }),
        ..SourceConfiguration::default()
    };
    let output = agent
        .extract(&source, &configuration, &analysis(&endpoint, WorkflowKind::SinglePass))
        .unwrap();
    let urls = handle.join().unwrap();

    assert_eq!(output.opportunities.len(), 3);
    assert_eq!(output.metrics.api_calls, 3);
    assert!(urls[0].contains("limit=2") && urls[0].contains("offset=0"), "{}", urls[0]);
    assert!(urls[1].contains("offset=2"), "{}", urls[1]);
    assert!(urls[2].contains("offset=4"), "{}", urls[2]);
}

#[test]
fn cursor_pagination_stops_when_the_cursor_ends() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}/opps", server.server_addr());
    let handle = thread::spawn(move || {
        let mut urls = Vec::new();
        for page in 0..2 {
            let request = server.recv().unwrap();
            urls.push(request.url().to_string());
            let body = if page == 0 {
                serde_json::json!({
                    "data": { "items": [{ "id": "A1", "title": "One" }] },
                    "meta": { "next": "cursor-2" }
                })
            } else {
                serde_json::json!({
                    "data": { "items": [{ "id": "A2", "title": "Two" }] },
                    "meta": { "next": null }
                })
            };
            request.respond(Response::from_string(body.to_string())).unwrap();
        }
        urls
    });

    let agent = local_agent();
    let source = local_source(&endpoint, AuthDescriptor::None);
    let configuration = SourceConfiguration {
        response_mapping: mapping(),
        pagination: Some(PaginationConfig {
            scheme: PaginationScheme::Cursor {
                cursor_param: "cursor".to_string(),
                next_cursor_path: "meta.next".to_string(),
            },
            limit_param: "limit".to_string(),
            page_size: 1,
            max_pages: 10,
            placement: ParamPlacement::Query,
        }),
        ..SourceConfiguration::default()
    };
    let output = agent
        .extract(&source, &configuration, &analysis(&endpoint, WorkflowKind::SinglePass))
        .unwrap();
    let urls = handle.join().unwrap();

    assert_eq!(output.opportunities.len(), 2);
    assert!(!urls[0].contains("cursor="), "{}", urls[0]);
    assert!(urls[1].contains("cursor=cursor-2"), "{}", urls[1]);
}

// ============================================================================
// SECTION: Auth and Detail
// ============================================================================

#[test]
fn query_placed_api_keys_reach_the_request() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}/opps", server.server_addr());
    let handle = thread::spawn(move || {
        let request = server.recv().unwrap();
        let url = request.url().to_string();
        let body = serde_json::json!({ "data": { "items": [] } });
        request.respond(Response::from_string(body.to_string())).unwrap();
        url
    });

    let agent = local_agent();
    let source = local_source(
        &endpoint,
        AuthDescriptor::ApiKey {
            key_name: "api_key".to_string(),
            key_value: "secret-1".to_string(),
            location: ApiKeyLocation::Query,
        },
    );
    let configuration = SourceConfiguration {
        response_mapping: mapping(),
        ..SourceConfiguration::default()
    };
    let output = agent
        .extract(&source, &configuration, &analysis(&endpoint, WorkflowKind::SinglePass))
        .unwrap();
    let url = handle.join().unwrap();
    assert!(output.opportunities.is_empty());
    assert!(url.contains("api_key=secret-1"), "{url}");
}

#[test]
fn detail_fanout_merges_detail_fields_over_list_fields() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let base = format!("http://{}", server.server_addr());
    let endpoint = format!("{base}/opps");
    let detail_endpoint = format!("{base}/detail");
    let handle = thread::spawn(move || {
        let list = server.recv().unwrap();
        let body = serde_json::json!({
            "data": { "items": [{ "record_id": "A1", "title": "List Title" }] }
        });
        list.respond(Response::from_string(body.to_string())).unwrap();

        let detail = server.recv().unwrap();
        let detail_url = detail.url().to_string();
        let body = serde_json::json!({
            "record": { "record_id": "A1", "title": "Detail Title",
                        "amounts": { "total": 42_000 } }
        });
        detail.respond(Response::from_string(body.to_string())).unwrap();
        detail_url
    });

    let agent = local_agent();
    let source = local_source(&endpoint, AuthDescriptor::None);
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), CanonicalField::Title);
    fields.insert("amounts.total".to_string(), CanonicalField::TotalFunding);
    let configuration = SourceConfiguration {
        response_mapping: ResponseMapping {
            data_path: Some("data.items".to_string()),
            fields,
        },
        detail: Some(DetailConfig {
            endpoint: detail_endpoint,
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            id_field: "record_id".to_string(),
            id_param: "id".to_string(),
            response_data_path: Some("record".to_string()),
        }),
        request: RequestConfig::default(),
        ..SourceConfiguration::default()
    };
    let output = agent
        .extract(&source, &configuration, &analysis(&endpoint, WorkflowKind::TwoStep))
        .unwrap();
    let detail_url = handle.join().unwrap();

    assert_eq!(output.metrics.api_calls, 2);
    assert!(detail_url.contains("id=A1"), "{detail_url}");
    let record = &output.opportunities[0];
    assert_eq!(record.api_opportunity_id.as_deref(), Some("A1"));
    assert_eq!(record.title.as_deref(), Some("Detail Title"));
    assert_eq!(record.total_funding, Some(42_000.0));
}

// ============================================================================
// SECTION: Failure Modes
// ============================================================================

#[test]
fn non_success_statuses_surface_with_the_code() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}/opps", server.server_addr());
    let handle = thread::spawn(move || {
        let request = server.recv().unwrap();
        request.respond(Response::from_string("slow down").with_status_code(429)).unwrap();
    });

    let agent = local_agent();
    let source = local_source(&endpoint, AuthDescriptor::None);
    let err = agent
        .extract(
            &source,
            &SourceConfiguration::default(),
            &analysis(&endpoint, WorkflowKind::SinglePass),
        )
        .unwrap_err();
    handle.join().unwrap();
    match err {
        ExtractError::Http {
            status, ..
        } => assert_eq!(status, 429),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn oversized_responses_fail_closed() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}/opps", server.server_addr());
    let handle = thread::spawn(move || {
        let request = server.recv().unwrap();
        let big = "x".repeat(128 * 1024);
        request.respond(Response::from_string(big)).unwrap();
    });

    let agent = local_agent();
    let source = local_source(&endpoint, AuthDescriptor::None);
    let err = agent
        .extract(
            &source,
            &SourceConfiguration::default(),
            &analysis(&endpoint, WorkflowKind::SinglePass),
        )
        .unwrap_err();
    handle.join().unwrap();
    assert!(matches!(err, ExtractError::TooLarge(_)), "{err}");
}

#[test]
fn cleartext_endpoints_are_rejected_by_default() {
    let agent = HttpFetchAgent::new(HttpFetchConfig::default(), None, Arc::new(SystemClock))
        .unwrap();
    let source = local_source("http://127.0.0.1:1/opps", AuthDescriptor::None);
    let err = agent
        .extract(
            &source,
            &SourceConfiguration::default(),
            &analysis("http://127.0.0.1:1/opps", WorkflowKind::SinglePass),
        )
        .unwrap_err();
    assert!(matches!(err, ExtractError::Invalid(_)), "{err}");
}
