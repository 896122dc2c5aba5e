// fundline-agents/src/mapping.rs
// ============================================================================
// Module: Response Mapping
// Description: Canonical-field mapping over one upstream record.
// Purpose: Turn a JSON record into an extracted opportunity, failing soft per field.
// Dependencies: fundline-core, serde_json, crate::path
// ============================================================================

//! ## Overview
//! The mapper applies a source's response-mapping entries to one JSON
//! record. Text fields trim, amounts parse through the shared amount
//! parser, and dates accept RFC 3339 or plain `YYYY-MM-DD`. Unresolvable or
//! unparseable fields map to `None`; record-level identity validation is
//! the duplicate detector's job, not the mapper's.

// ============================================================================
// SECTION: Imports
// ============================================================================

use fundline_core::CanonicalField;
use fundline_core::ExtractedOpportunity;
use fundline_core::ResponseMapping;
use fundline_core::Timestamp;
use serde_json::Value;

use crate::path::resolve_amount;
use crate::path::resolve_text;

// ============================================================================
// SECTION: Record Mapping
// ============================================================================

/// Dot path conventionally carrying the external identifier when the
/// mapping has no explicit entry for it.
const DEFAULT_ID_PATHS: [&str; 3] = ["id", "opportunity_id", "opportunityId"];

/// Maps one JSON record to an extracted opportunity.
#[must_use]
pub fn map_record(record: &Value, mapping: &ResponseMapping, id_path: Option<&str>) -> ExtractedOpportunity {
    let api_opportunity_id = id_path
        .and_then(|path| resolve_text(record, path))
        .or_else(|| DEFAULT_ID_PATHS.iter().find_map(|path| resolve_text(record, path)));
    let mut extracted = ExtractedOpportunity {
        api_opportunity_id,
        ..ExtractedOpportunity::default()
    };
    for (path, field) in &mapping.fields {
        apply_field(&mut extracted, record, path, *field);
    }
    extracted
}

/// Applies one mapping entry to the extracted record.
fn apply_field(
    extracted: &mut ExtractedOpportunity,
    record: &Value,
    path: &str,
    field: CanonicalField,
) {
    match field {
        CanonicalField::Title => extracted.title = resolve_text(record, path),
        CanonicalField::Description => extracted.description = resolve_text(record, path),
        CanonicalField::FundingType => extracted.funding_type = resolve_text(record, path),
        CanonicalField::Agency => extracted.agency = resolve_text(record, path),
        CanonicalField::TotalFunding => extracted.total_funding = resolve_amount(record, path),
        CanonicalField::MinAward => extracted.min_award = resolve_amount(record, path),
        CanonicalField::MaxAward => extracted.max_award = resolve_amount(record, path),
        CanonicalField::OpenDate => {
            extracted.open_date = resolve_text(record, path).as_deref().and_then(parse_date);
        }
        CanonicalField::CloseDate => {
            extracted.close_date = resolve_text(record, path).as_deref().and_then(parse_date);
        }
        CanonicalField::Eligibility => extracted.eligibility = resolve_text(record, path),
        CanonicalField::Url => extracted.url = resolve_text(record, path),
    }
}

// ============================================================================
// SECTION: Date Parsing
// ============================================================================

/// Parses an upstream date: RFC 3339, or `YYYY-MM-DD` taken as UTC midnight.
#[must_use]
pub fn parse_date(text: &str) -> Option<Timestamp> {
    let trimmed = text.trim();
    if let Ok(parsed) = Timestamp::parse_iso8601(trimmed) {
        return Some(parsed);
    }
    let date_only = format!("{trimmed}T00:00:00Z");
    Timestamp::parse_iso8601(&date_only).ok()
}

/// Merges a detail record over a list record; detail fields win.
#[must_use]
pub fn merge_records(list_record: &Value, detail_record: &Value) -> Value {
    match (list_record, detail_record) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, detail) => detail.clone(),
    }
}
