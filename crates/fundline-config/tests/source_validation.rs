// fundline-config/tests/source_validation.rs
// ============================================================================
// Module: Source Validation Tests
// Description: Auth, pagination, detail, and mapping-path rules.
// Purpose: Pin the admin-side fail-closed validation of source bodies.
// ============================================================================

//! Source-rule tests: per-type auth well-formedness, scheme-consistent
//! pagination, complete detail configuration, and dot-path syntax.

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

use std::collections::BTreeMap;

use fundline_config::SourceRuleError;
use fundline_config::is_dot_path;
use fundline_config::validate_auth;
use fundline_config::validate_configuration;
use fundline_config::validate_detail;
use fundline_config::validate_pagination;
use fundline_config::validate_source;
use fundline_core::ApiKeyLocation;
use fundline_core::AuthDescriptor;
use fundline_core::CanonicalField;
use fundline_core::DetailConfig;
use fundline_core::HandlerType;
use fundline_core::HttpMethod;
use fundline_core::PaginationConfig;
use fundline_core::PaginationScheme;
use fundline_core::ParamPlacement;
use fundline_core::ResponseMapping;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::SourceId;
use fundline_core::SourceType;
use fundline_core::Timestamp;
use fundline_core::UpdateCadence;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// A well-formed active source.
fn valid_source() -> Source {
    Source {
        source_id: SourceId::generate(),
        name: "Grants API".to_string(),
        organization: "Energy Office".to_string(),
        source_type: SourceType::Federal,
        url: "https://api.example.test".to_string(),
        api_endpoint: Some("/v1/opps".to_string()),
        api_documentation_url: None,
        auth: AuthDescriptor::None,
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

/// A well-formed offset pagination block.
fn valid_pagination() -> PaginationConfig {
    PaginationConfig {
        scheme: PaginationScheme::Offset {
            offset_param: "offset".to_string(),
        },
        limit_param: "limit".to_string(),
        page_size: 50,
        max_pages: 10,
        placement: ParamPlacement::Query,
    }
}

// ============================================================================
// SECTION: Row and Auth Rules
// ============================================================================

#[test]
fn valid_sources_pass() {
    validate_source(&valid_source(), &SourceConfiguration::default()).unwrap();
}

#[test]
fn blank_mandatory_fields_are_rejected() {
    let mut source = valid_source();
    source.name = "  ".to_string();
    assert_eq!(
        validate_source(&source, &SourceConfiguration::default()),
        Err(SourceRuleError::MissingField("name"))
    );

    let mut source = valid_source();
    source.url = "not a url".to_string();
    assert_eq!(
        validate_source(&source, &SourceConfiguration::default()),
        Err(SourceRuleError::InvalidUrl)
    );
}

#[test]
fn auth_descriptors_must_be_well_formed_per_type() {
    validate_auth(&AuthDescriptor::None).unwrap();
    validate_auth(&AuthDescriptor::ApiKey {
        key_name: "x-api-key".to_string(),
        key_value: "secret".to_string(),
        location: ApiKeyLocation::Header,
    })
    .unwrap();
    assert!(
        validate_auth(&AuthDescriptor::ApiKey {
            key_name: " ".to_string(),
            key_value: "secret".to_string(),
            location: ApiKeyLocation::Query,
        })
        .is_err()
    );
    assert!(
        validate_auth(&AuthDescriptor::Basic {
            username: String::new(),
            password: "pw".to_string(),
        })
        .is_err()
    );
    assert!(
        validate_auth(&AuthDescriptor::Bearer {
            token: "  ".to_string(),
        })
        .is_err()
    );
}

// ============================================================================
// SECTION: Pagination and Detail Rules
// ============================================================================

#[test]
fn pagination_limits_and_scheme_fields_are_enforced() {
    validate_pagination(&valid_pagination()).unwrap();

    let mut pagination = valid_pagination();
    pagination.page_size = 0;
    assert!(validate_pagination(&pagination).is_err());

    let mut pagination = valid_pagination();
    pagination.max_pages = 0;
    assert!(validate_pagination(&pagination).is_err());

    let cursor = PaginationConfig {
        scheme: PaginationScheme::Cursor {
            cursor_param: "cursor".to_string(),
            next_cursor_path: "meta..next".to_string(),
        },
        ..valid_pagination()
    };
    assert!(validate_pagination(&cursor).is_err());
}

#[test]
fn detail_configuration_must_be_complete() {
    let detail = DetailConfig {
        endpoint: "https://api.example.test/detail".to_string(),
        method: HttpMethod::Get,
        headers: BTreeMap::new(),
        id_field: "record_id".to_string(),
        id_param: "id".to_string(),
        response_data_path: Some("record".to_string()),
    };
    validate_detail(&detail).unwrap();

    let mut broken = detail.clone();
    broken.id_param = String::new();
    assert!(validate_detail(&broken).is_err());

    let mut broken = detail;
    broken.id_field = "record id".to_string();
    assert!(validate_detail(&broken).is_err());
}

// ============================================================================
// SECTION: Mapping Paths
// ============================================================================

#[test]
fn mapping_paths_must_be_dot_notation() {
    assert!(is_dot_path("data.items"));
    assert!(is_dot_path("amounts.total_usd"));
    assert!(!is_dot_path(""));
    assert!(!is_dot_path("a..b"));
    assert!(!is_dot_path("a.b c"));

    let mut fields = BTreeMap::new();
    fields.insert("bad path".to_string(), CanonicalField::Title);
    let configuration = SourceConfiguration {
        response_mapping: ResponseMapping {
            data_path: None,
            fields,
        },
        ..SourceConfiguration::default()
    };
    assert!(matches!(
        validate_configuration(&configuration),
        Err(SourceRuleError::InvalidMappingPath(_))
    ));
}
