// fundline-core/src/core/opportunity.rs
// ============================================================================
// Module: Fundline Opportunity Model
// Description: Extracted and canonical funding-opportunity records.
// Purpose: Provide the normalized record shape and the material-field set used
//          for duplicate detection and direct updates.
// Dependencies: crate::core::{identifiers, time}, serde, serde_json
// ============================================================================

//! ## Overview
//! Extracted opportunities are the mapper's best effort over one upstream
//! record: every field optional, dates and amounts parsed at the extraction
//! boundary. Canonical opportunities are the persisted rows, keyed by
//! `(source_id, api_opportunity_id)` and guarded by a revision counter for
//! optimistic concurrency.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::OpportunityId;
use crate::core::identifiers::SourceId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Extracted Records
// ============================================================================

/// One upstream record after response mapping.
///
/// # Invariants
/// - Fields are `None` when the mapping produced nothing usable; blank
///   strings are preserved so the detector can count validation failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractedOpportunity {
    /// External identifier, as received.
    pub api_opportunity_id: Option<String>,
    /// Title, as received.
    pub title: Option<String>,
    /// Description text.
    pub description: Option<String>,
    /// Funding type tag.
    pub funding_type: Option<String>,
    /// Administering agency.
    pub agency: Option<String>,
    /// Minimum award amount in USD.
    pub min_award: Option<f64>,
    /// Maximum award amount in USD.
    pub max_award: Option<f64>,
    /// Total program funding in USD.
    pub total_funding: Option<f64>,
    /// Open date.
    pub open_date: Option<Timestamp>,
    /// Close date.
    pub close_date: Option<Timestamp>,
    /// Eligibility text.
    pub eligibility: Option<String>,
    /// Landing-page URL.
    pub url: Option<String>,
}

impl ExtractedOpportunity {
    /// Returns the trimmed external identifier when non-blank.
    #[must_use]
    pub fn trimmed_api_id(&self) -> Option<&str> {
        self.api_opportunity_id.as_deref().map(str::trim).filter(|value| !value.is_empty())
    }

    /// Returns the trimmed title when non-blank.
    #[must_use]
    pub fn trimmed_title(&self) -> Option<&str> {
        self.title.as_deref().map(str::trim).filter(|value| !value.is_empty())
    }
}

// ============================================================================
// SECTION: Analysis Fields
// ============================================================================

/// LM-produced scoring and categorization for one opportunity.
///
/// # Invariants
/// - `relevance_score` lies in [0, 10].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityAnalysis {
    /// Relevance score assigned by the analysis agent.
    pub relevance_score: f64,
    /// Category tags assigned by the analysis agent.
    pub categories: Vec<String>,
    /// One-paragraph summary.
    pub summary: String,
    /// Model tag that produced the analysis.
    pub model: String,
    /// Tokens consumed for this record.
    pub tokens_used: u64,
}

// ============================================================================
// SECTION: Canonical Records
// ============================================================================

/// Canonical funding-opportunity row.
///
/// # Invariants
/// - `(source_id, api_opportunity_id)` is unique across the store.
/// - Award amounts are non-negative.
/// - `close_date >= open_date` when both are present.
/// - `revision` increases by one on every store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Canonical identifier.
    pub opportunity_id: OpportunityId,
    /// Owning source.
    pub source_id: SourceId,
    /// External identifier, unique within the source.
    pub api_opportunity_id: String,
    /// Title.
    pub title: String,
    /// Description text.
    pub description: Option<String>,
    /// Funding type tag.
    pub funding_type: Option<String>,
    /// Administering agency.
    pub agency: Option<String>,
    /// Minimum award amount in USD.
    pub min_award: Option<f64>,
    /// Maximum award amount in USD.
    pub max_award: Option<f64>,
    /// Total program funding in USD.
    pub total_funding: Option<f64>,
    /// Open date.
    pub open_date: Option<Timestamp>,
    /// Close date.
    pub close_date: Option<Timestamp>,
    /// Eligibility text.
    pub eligibility: Option<String>,
    /// Landing-page URL.
    pub url: Option<String>,
    /// LM analysis fields, absent for rows stored without enrichment.
    pub analysis: Option<OpportunityAnalysis>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time; doubles as the freshness marker.
    pub updated_at: Timestamp,
    /// Optimistic-concurrency revision.
    pub revision: u64,
}

impl Opportunity {
    /// Returns the normalized title used for secondary duplicate lookup.
    #[must_use]
    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Normalizes a title for exact-match lookup: lowercased with whitespace
/// runs collapsed to single spaces.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<&str>>().join(" ").to_lowercase()
}

// ============================================================================
// SECTION: Material Fields
// ============================================================================

/// Fields compared by the duplicate detector and patched by direct updates.
///
/// # Invariants
/// - The variant set is fixed; adding a field changes detection semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialField {
    /// Title text.
    Title,
    /// Description text.
    Description,
    /// Close date.
    CloseDate,
    /// Minimum award amount.
    MinAward,
    /// Maximum award amount.
    MaxAward,
    /// Total program funding.
    TotalFunding,
    /// Eligibility text.
    Eligibility,
    /// Landing-page URL.
    Url,
}

impl MaterialField {
    /// All material fields in canonical comparison order.
    pub const ALL: [Self; 8] = [
        Self::Title,
        Self::Description,
        Self::CloseDate,
        Self::MinAward,
        Self::MaxAward,
        Self::TotalFunding,
        Self::Eligibility,
        Self::Url,
    ];

    /// Returns the snake_case field name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::CloseDate => "close_date",
            Self::MinAward => "min_award",
            Self::MaxAward => "max_award",
            Self::TotalFunding => "total_funding",
            Self::Eligibility => "eligibility",
            Self::Url => "url",
        }
    }
}

/// Typed value carried by a direct-update patch.
///
/// # Invariants
/// - The value variant matches the target field's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Text value or explicit null.
    Text(Option<String>),
    /// Numeric value or explicit null.
    Number(Option<f64>),
    /// Timestamp value or explicit null.
    Time(Option<Timestamp>),
}

/// One field assignment applied by the direct-update handler.
///
/// # Invariants
/// - `field` is one of the material fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPatch {
    /// Target field.
    pub field: MaterialField,
    /// New value.
    pub value: FieldValue,
}

impl FieldPatch {
    /// Builds the patch for one material field from an extracted record.
    #[must_use]
    pub fn from_extracted(field: MaterialField, record: &ExtractedOpportunity) -> Self {
        let value = match field {
            MaterialField::Title => FieldValue::Text(record.title.clone()),
            MaterialField::Description => FieldValue::Text(record.description.clone()),
            MaterialField::CloseDate => FieldValue::Time(record.close_date),
            MaterialField::MinAward => FieldValue::Number(record.min_award),
            MaterialField::MaxAward => FieldValue::Number(record.max_award),
            MaterialField::TotalFunding => FieldValue::Number(record.total_funding),
            MaterialField::Eligibility => FieldValue::Text(record.eligibility.clone()),
            MaterialField::Url => FieldValue::Text(record.url.clone()),
        };
        Self {
            field,
            value,
        }
    }
}

// ============================================================================
// SECTION: Raw Response References
// ============================================================================

/// Stored raw external response, referenced by id from extraction metrics.
///
/// # Invariants
/// - Bodies are byte-capped by the storing component; only the reference id
///   travels through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    /// Reference identifier.
    pub raw_response_id: String,
    /// Owning source.
    pub source_id: SourceId,
    /// Raw response payload.
    pub body: Value,
    /// Capture time.
    pub captured_at: Timestamp,
}
