// fundline-config/src/source_rules.rs
// ============================================================================
// Module: Fundline Source Rules
// Description: Validation of admin-submitted source bodies and bundles.
// Purpose: Fail closed on malformed auth, pagination, detail, and mapping input.
// Dependencies: fundline-core, serde, url
// ============================================================================

//! ## Overview
//! Admin source-create and source-update bodies are validated here before
//! any row is written: auth descriptors must be well-formed for their type,
//! pagination parameters must be consistent with their scheme, detail
//! configuration must be complete when present, and every response-mapping
//! path must be valid dot notation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use fundline_core::AuthDescriptor;
use fundline_core::DetailConfig;
use fundline_core::PaginationConfig;
use fundline_core::PaginationScheme;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use thiserror::Error;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum length of a source display name.
pub(crate) const MAX_NAME_LENGTH: usize = 256;
/// Maximum length of an organization name.
pub(crate) const MAX_ORGANIZATION_LENGTH: usize = 256;
/// Maximum number of response-mapping entries.
pub(crate) const MAX_MAPPING_ENTRIES: usize = 64;
/// Maximum number of static query parameters.
pub(crate) const MAX_QUERY_PARAMS: usize = 64;
/// Maximum accepted page size.
pub(crate) const MAX_PAGE_SIZE: u32 = 1_000;
/// Maximum accepted page count per run.
pub(crate) const MAX_PAGES: u32 = 1_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Source validation errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling and admin display.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceRuleError {
    /// A required field is missing or blank.
    #[error("source validation failed: {0} is required")]
    MissingField(&'static str),
    /// A field exceeds its length or count limit.
    #[error("source validation failed: {0} exceeds its limit")]
    LimitExceeded(&'static str),
    /// The base URL is not a valid absolute URL.
    #[error("source validation failed: url is not a valid absolute url")]
    InvalidUrl,
    /// The auth descriptor is malformed for its type.
    #[error("source validation failed: auth descriptor is malformed: {0}")]
    MalformedAuth(&'static str),
    /// The pagination configuration is inconsistent.
    #[error("source validation failed: pagination is inconsistent: {0}")]
    InvalidPagination(&'static str),
    /// The detail configuration is incomplete.
    #[error("source validation failed: detail configuration is incomplete: {0}")]
    InvalidDetail(&'static str),
    /// A response-mapping path is not valid dot notation.
    #[error("source validation failed: mapping path is not dot notation: {0}")]
    InvalidMappingPath(String),
}

// ============================================================================
// SECTION: Source Validation
// ============================================================================

/// Validates a source row together with its configuration bundle.
///
/// # Errors
///
/// Returns [`SourceRuleError`] on the first violated rule.
pub fn validate_source(
    source: &Source,
    configuration: &SourceConfiguration,
) -> Result<(), SourceRuleError> {
    validate_row(source)?;
    validate_configuration(configuration)
}

/// Validates the source row fields.
///
/// # Errors
///
/// Returns [`SourceRuleError`] on the first violated rule.
pub fn validate_row(source: &Source) -> Result<(), SourceRuleError> {
    if source.name.trim().is_empty() {
        return Err(SourceRuleError::MissingField("name"));
    }
    if source.name.len() > MAX_NAME_LENGTH {
        return Err(SourceRuleError::LimitExceeded("name"));
    }
    if source.organization.trim().is_empty() {
        return Err(SourceRuleError::MissingField("organization"));
    }
    if source.organization.len() > MAX_ORGANIZATION_LENGTH {
        return Err(SourceRuleError::LimitExceeded("organization"));
    }
    if source.url.trim().is_empty() {
        return Err(SourceRuleError::MissingField("url"));
    }
    if Url::parse(source.url.trim()).is_err() {
        return Err(SourceRuleError::InvalidUrl);
    }
    if let Some(endpoint) = &source.api_endpoint
        && endpoint.trim().is_empty()
    {
        return Err(SourceRuleError::MissingField("api_endpoint"));
    }
    validate_auth(&source.auth)
}

/// Validates an auth descriptor for its declared type.
///
/// # Errors
///
/// Returns [`SourceRuleError::MalformedAuth`] when a credential field is
/// blank.
pub fn validate_auth(auth: &AuthDescriptor) -> Result<(), SourceRuleError> {
    match auth {
        AuthDescriptor::None => Ok(()),
        AuthDescriptor::ApiKey {
            key_name,
            key_value,
            ..
        } => {
            if key_name.trim().is_empty() {
                return Err(SourceRuleError::MalformedAuth("api key name is blank"));
            }
            if key_value.trim().is_empty() {
                return Err(SourceRuleError::MalformedAuth("api key value is blank"));
            }
            Ok(())
        }
        AuthDescriptor::Basic {
            username, ..
        } => {
            if username.trim().is_empty() {
                return Err(SourceRuleError::MalformedAuth("basic username is blank"));
            }
            Ok(())
        }
        AuthDescriptor::Bearer {
            token,
        } => {
            if token.trim().is_empty() {
                return Err(SourceRuleError::MalformedAuth("bearer token is blank"));
            }
            Ok(())
        }
    }
}

/// Validates a configuration bundle.
///
/// # Errors
///
/// Returns [`SourceRuleError`] on the first violated rule.
pub fn validate_configuration(
    configuration: &SourceConfiguration,
) -> Result<(), SourceRuleError> {
    if configuration.query_params.len() > MAX_QUERY_PARAMS {
        return Err(SourceRuleError::LimitExceeded("query_params"));
    }
    if let Some(pagination) = &configuration.pagination {
        validate_pagination(pagination)?;
    }
    if let Some(detail) = &configuration.detail {
        validate_detail(detail)?;
    }
    let mapping = &configuration.response_mapping;
    if mapping.fields.len() > MAX_MAPPING_ENTRIES {
        return Err(SourceRuleError::LimitExceeded("response_mapping"));
    }
    if let Some(data_path) = &mapping.data_path
        && !is_dot_path(data_path)
    {
        return Err(SourceRuleError::InvalidMappingPath(data_path.clone()));
    }
    for path in mapping.fields.keys() {
        if !is_dot_path(path) {
            return Err(SourceRuleError::InvalidMappingPath(path.clone()));
        }
    }
    Ok(())
}

/// Validates a pagination configuration for its scheme.
///
/// # Errors
///
/// Returns [`SourceRuleError::InvalidPagination`] on the first violated
/// rule.
pub fn validate_pagination(pagination: &PaginationConfig) -> Result<(), SourceRuleError> {
    if pagination.limit_param.trim().is_empty() {
        return Err(SourceRuleError::InvalidPagination("limit_param is blank"));
    }
    if pagination.page_size == 0 || pagination.page_size > MAX_PAGE_SIZE {
        return Err(SourceRuleError::InvalidPagination("page_size out of range"));
    }
    if pagination.max_pages == 0 || pagination.max_pages > MAX_PAGES {
        return Err(SourceRuleError::InvalidPagination("max_pages out of range"));
    }
    match &pagination.scheme {
        PaginationScheme::Offset {
            offset_param,
        } => {
            if offset_param.trim().is_empty() {
                return Err(SourceRuleError::InvalidPagination("offset_param is blank"));
            }
        }
        PaginationScheme::Page {
            page_param,
        } => {
            if page_param.trim().is_empty() {
                return Err(SourceRuleError::InvalidPagination("page_param is blank"));
            }
        }
        PaginationScheme::Cursor {
            cursor_param,
            next_cursor_path,
        } => {
            if cursor_param.trim().is_empty() {
                return Err(SourceRuleError::InvalidPagination("cursor_param is blank"));
            }
            if !is_dot_path(next_cursor_path) {
                return Err(SourceRuleError::InvalidPagination("next_cursor_path is not dot notation"));
            }
        }
    }
    Ok(())
}

/// Validates a detail configuration.
///
/// # Errors
///
/// Returns [`SourceRuleError::InvalidDetail`] on the first violated rule.
pub fn validate_detail(detail: &DetailConfig) -> Result<(), SourceRuleError> {
    if detail.endpoint.trim().is_empty() {
        return Err(SourceRuleError::InvalidDetail("endpoint is blank"));
    }
    if detail.id_field.trim().is_empty() || !is_dot_path(&detail.id_field) {
        return Err(SourceRuleError::InvalidDetail("id_field is not dot notation"));
    }
    if detail.id_param.trim().is_empty() {
        return Err(SourceRuleError::InvalidDetail("id_param is blank"));
    }
    if let Some(path) = &detail.response_data_path
        && !is_dot_path(path)
    {
        return Err(SourceRuleError::InvalidDetail("response_data_path is not dot notation"));
    }
    Ok(())
}

// ============================================================================
// SECTION: Dot Paths
// ============================================================================

/// Returns true for non-empty dot paths with non-empty segments.
#[must_use]
pub fn is_dot_path(path: &str) -> bool {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return false;
    }
    trimmed.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}
