// fundline-core/src/core/source.rs
// ============================================================================
// Module: Fundline Source Model
// Description: Declarative descriptions of external funding APIs.
// Purpose: Provide typed source rows and configuration bundles with stable wire forms.
// Dependencies: crate::core::{identifiers, time}, serde, serde_json
// ============================================================================

//! ## Overview
//! A source describes one upstream HTTP API: endpoint, auth, pagination,
//! optional per-item detail calls, and the mapping from response fields to
//! the canonical opportunity shape. Dynamic nested mappings from admin input
//! are modeled as typed structs with tagged unions so invalid combinations
//! are unrepresentable.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::SourceId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Source Row
// ============================================================================

/// Organization class of a funding source.
///
/// # Invariants
/// - Variants are stable for serialization and admin filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Federal agency source.
    Federal,
    /// State agency source.
    State,
    /// Local government source.
    Local,
    /// Utility program source.
    Utility,
    /// Private foundation source.
    Private,
    /// Nonprofit program source.
    Nonprofit,
}

/// Handler family used to process the source.
///
/// # Invariants
/// - Variants are stable for serialization and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    /// Standard JSON list API.
    Standard,
    /// Document-oriented API.
    Document,
    /// State portal API.
    StatePortal,
}

/// Update cadence tag controlling next-due scheduling.
///
/// # Invariants
/// - Variants are stable for serialization and scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateCadence {
    /// Re-check at least hourly.
    Hourly,
    /// Re-check at least daily.
    Daily,
    /// Re-check at least weekly.
    Weekly,
    /// Re-check at least monthly.
    Monthly,
}

impl UpdateCadence {
    /// Returns the minimum re-check interval in milliseconds.
    #[must_use]
    pub const fn interval_ms(self) -> i64 {
        match self {
            Self::Hourly => 3_600_000,
            Self::Daily => 86_400_000,
            Self::Weekly => 604_800_000,
            Self::Monthly => 2_592_000_000,
        }
    }
}

/// Placement of an API key credential on the request.
///
/// # Invariants
/// - Variants are stable for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyLocation {
    /// Key travels as a request header.
    Header,
    /// Key travels as a query parameter.
    Query,
}

/// Authentication descriptor for an upstream API.
///
/// # Invariants
/// - Well-formedness per variant is enforced by configuration validation:
///   non-empty key names, tokens, and usernames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum AuthDescriptor {
    /// No authentication.
    None,
    /// Static API key in a header or query parameter.
    ApiKey {
        /// Header or query parameter name carrying the key.
        key_name: String,
        /// Key value.
        key_value: String,
        /// Where the key is placed on the request.
        location: ApiKeyLocation,
    },
    /// HTTP basic authentication.
    Basic {
        /// Basic-auth username.
        username: String,
        /// Basic-auth password.
        password: String,
    },
    /// Bearer token authentication.
    Bearer {
        /// Bearer token value.
        token: String,
    },
}

/// Declarative description of one external funding API.
///
/// # Invariants
/// - `source_id` is unique across the store.
/// - When `active` is true, `name`, `organization`, and `url` are non-empty.
/// - `last_checked` and `force_full_reprocessing` are written only by the
///   coordinator; all other fields are written by admin actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Source identifier.
    pub source_id: SourceId,
    /// Display name.
    pub name: String,
    /// Owning organization.
    pub organization: String,
    /// Organization class.
    pub source_type: SourceType,
    /// Base URL of the upstream service.
    pub url: String,
    /// Optional API endpoint relative to or overriding the base URL.
    pub api_endpoint: Option<String>,
    /// Optional documentation link for operators.
    pub api_documentation_url: Option<String>,
    /// Authentication descriptor.
    pub auth: AuthDescriptor,
    /// Update cadence tag.
    pub update_frequency: UpdateCadence,
    /// Handler family.
    pub handler_type: HandlerType,
    /// Free-form operator notes.
    pub notes: Option<String>,
    /// Whether the source participates in scheduling.
    pub active: bool,
    /// Per-source force-full-reprocessing flag.
    pub force_full_reprocessing: bool,
    /// Last time the coordinator checked this source.
    pub last_checked: Option<Timestamp>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

// ============================================================================
// SECTION: Request Configuration
// ============================================================================

/// HTTP method used for list or detail calls.
///
/// # Invariants
/// - Variants are stable for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
}

impl HttpMethod {
    /// Returns the method as an uppercase token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// Request shape for the primary list call.
///
/// # Invariants
/// - Header names are unique; the map is ordered for deterministic requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestConfig {
    /// HTTP method for the list call.
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    /// Static request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Default method for list calls.
const fn default_method() -> HttpMethod {
    HttpMethod::Get
}

impl Default for HttpMethod {
    fn default() -> Self {
        Self::Get
    }
}

// ============================================================================
// SECTION: Pagination Configuration
// ============================================================================

/// Where pagination parameters are placed on the request.
///
/// # Invariants
/// - Variants are stable for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamPlacement {
    /// Parameters travel in the query string.
    #[default]
    Query,
    /// Parameters travel in the JSON request body.
    Body,
}

/// Pagination scheme, tagged by type.
///
/// # Invariants
/// - Each variant carries exactly the parameters its scheme requires, so a
///   configuration can never mix offset and cursor fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaginationScheme {
    /// Offset-based pagination.
    Offset {
        /// Parameter carrying the record offset.
        offset_param: String,
    },
    /// Page-number pagination.
    Page {
        /// Parameter carrying the 1-based page number.
        page_param: String,
    },
    /// Cursor pagination.
    Cursor {
        /// Parameter carrying the cursor for the next request.
        cursor_param: String,
        /// Dot path locating the next cursor in each response.
        next_cursor_path: String,
    },
}

/// Pagination configuration for the list call.
///
/// # Invariants
/// - `page_size` >= 1 and `max_pages` >= 1 after validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Pagination scheme and its parameters.
    pub scheme: PaginationScheme,
    /// Parameter carrying the page size.
    pub limit_param: String,
    /// Records requested per page.
    pub page_size: u32,
    /// Hard cap on pages fetched per run.
    pub max_pages: u32,
    /// Whether parameters travel in the query or the body.
    #[serde(default)]
    pub placement: ParamPlacement,
}

// ============================================================================
// SECTION: Detail Configuration
// ============================================================================

/// Per-item detail call configuration.
///
/// # Invariants
/// - Present only when detail calls are enabled for the source.
/// - `id_field` is a dot path into the list record; `id_param` names the
///   query parameter carrying that value on the detail request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailConfig {
    /// Detail endpoint URL template.
    pub endpoint: String,
    /// HTTP method for detail calls.
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    /// Static detail-request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Dot path locating the record identifier in the list record.
    pub id_field: String,
    /// Query parameter carrying the identifier on the detail request.
    pub id_param: String,
    /// Optional dot path locating the payload inside the detail response.
    pub response_data_path: Option<String>,
}

// ============================================================================
// SECTION: Response Mapping
// ============================================================================

/// Canonical opportunity field targeted by a response mapping entry.
///
/// # Invariants
/// - Variants are stable for serialization and cover the canonical shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    /// Opportunity title.
    Title,
    /// Opportunity description.
    Description,
    /// Funding type tag.
    FundingType,
    /// Administering agency.
    Agency,
    /// Total program funding.
    TotalFunding,
    /// Minimum award amount.
    MinAward,
    /// Maximum award amount.
    MaxAward,
    /// Open date.
    OpenDate,
    /// Close date.
    CloseDate,
    /// Eligibility text.
    Eligibility,
    /// Landing-page URL.
    Url,
}

/// Mapping from response fields to the canonical opportunity shape.
///
/// # Invariants
/// - Keys are dot paths into one response record.
/// - `data_path`, when present, locates the record array in the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResponseMapping {
    /// Optional dot path locating the record array in the list response.
    pub data_path: Option<String>,
    /// Source-field dot path to canonical-field assignments.
    pub fields: BTreeMap<String, CanonicalField>,
}

// ============================================================================
// SECTION: Configuration Bundle
// ============================================================================

/// Runtime configuration bundle owned by one source.
///
/// # Invariants
/// - Pagination and detail sections are present only when enabled.
/// - Response-mapping paths use dot notation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SourceConfiguration {
    /// Static query parameters added to every list request.
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    /// Static JSON body fields added to every list request.
    #[serde(default)]
    pub request_body: BTreeMap<String, Value>,
    /// Request method and headers.
    #[serde(default)]
    pub request: RequestConfig,
    /// Pagination configuration, when enabled.
    pub pagination: Option<PaginationConfig>,
    /// Per-item detail configuration, when enabled.
    pub detail: Option<DetailConfig>,
    /// Response-to-canonical field mapping.
    #[serde(default)]
    pub response_mapping: ResponseMapping,
}
