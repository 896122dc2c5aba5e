// fundline-core/src/runtime/detector.rs
// ============================================================================
// Module: Fundline Early Duplicate Detector
// Description: NEW / UPDATE / SKIP classification against the canonical store.
// Purpose: Keep unchanged duplicates away from the LM stages, deterministically.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! The detector classifies a batch of extracted records in iteration order:
//! identity validation first, then a batched lookup by external identifier,
//! then a batched fallback lookup by normalized title. Matches inside the
//! freshness window skip without a diff; otherwise a field-wise diff over
//! the fixed material-field set decides UPDATE versus SKIP. With the force
//! override every record is NEW and no store lookups are issued.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::core::DetectionMethod;
use crate::core::DuplicateDetectionSession;
use crate::core::ExtractedOpportunity;
use crate::core::MaterialField;
use crate::core::Opportunity;
use crate::core::RunId;
use crate::core::SourceId;
use crate::core::Timestamp;
use crate::core::normalize_title;
use crate::interfaces::DatastoreError;
use crate::interfaces::OpportunityStore;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Default freshness window in milliseconds (24 hours).
pub const DEFAULT_FRESHNESS_WINDOW_MS: u64 = 86_400_000;
/// Maximum identifiers per batched store lookup.
const LOOKUP_CHUNK_SIZE: usize = 200;

/// Detector configuration.
///
/// # Invariants
/// - `freshness_window_ms` is interpreted against the existing row's
///   `updated_at` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Freshness window in milliseconds.
    pub freshness_window_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            freshness_window_ms: DEFAULT_FRESHNESS_WINDOW_MS,
        }
    }
}

// ============================================================================
// SECTION: Classification Reasons
// ============================================================================

/// Reason attached to a record with no identity fields.
pub const REASON_VALIDATION_FAILURE: &str = "validation_failure";
/// Reason attached to NEW records.
pub const REASON_NO_DUPLICATE_FOUND: &str = "no_duplicate_found";
/// Reason attached to freshness-window skips.
pub const REASON_FRESH_NO_UPDATE_NEEDED: &str = "fresh_no_update_needed";
/// Reason attached to unchanged duplicates.
pub const REASON_NO_CHANGES_DETECTED: &str = "no_changes_detected";
/// Reason attached to changed duplicates.
pub const REASON_FIELDS_CHANGED: &str = "fields_changed";
/// Reason attached to force-override NEW records.
pub const REASON_FORCE_FULL_REPROCESSING: &str = "force_full_reprocessing";

// ============================================================================
// SECTION: Output Shapes
// ============================================================================

/// One changed duplicate slated for the direct-update fast path.
///
/// # Invariants
/// - `changes` is non-empty and ordered by the canonical field order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCandidate {
    /// Extracted record from the API.
    pub api_record: ExtractedOpportunity,
    /// Matched canonical row.
    pub existing: Opportunity,
    /// Material fields that differ.
    pub changes: Vec<MaterialField>,
    /// Classification reason.
    pub reason: String,
    /// Match method that established the duplicate.
    pub method: DetectionMethod,
}

/// One record dropped by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    /// Extracted record from the API.
    pub api_record: ExtractedOpportunity,
    /// Matched canonical row, when the skip came from a duplicate.
    pub existing: Option<Opportunity>,
    /// Classification reason.
    pub reason: String,
    /// Match method, when a duplicate was detected.
    pub method: Option<DetectionMethod>,
}

/// Full detector output for one batch.
///
/// # Invariants
/// - `session` totals reconcile with the three lists plus validation
///   failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    /// Records classified NEW, in input order.
    pub new_opportunities: Vec<ExtractedOpportunity>,
    /// Records classified UPDATE, in input order.
    pub opportunities_to_update: Vec<UpdateCandidate>,
    /// Records classified SKIP (including validation failures), in input order.
    pub opportunities_to_skip: Vec<SkipRecord>,
    /// Session metrics for the batch.
    pub session: DuplicateDetectionSession,
}

// ============================================================================
// SECTION: Detector
// ============================================================================

/// Early duplicate detector over the canonical opportunity store.
pub struct EarlyDuplicateDetector<'a> {
    /// Canonical store used for batched lookups.
    store: &'a dyn OpportunityStore,
    /// Detector configuration.
    config: DetectorConfig,
}

impl<'a> EarlyDuplicateDetector<'a> {
    /// Creates a detector over the given store.
    #[must_use]
    pub const fn new(store: &'a dyn OpportunityStore, config: DetectorConfig) -> Self {
        Self {
            store,
            config,
        }
    }

    /// Classifies a batch of extracted records.
    ///
    /// With `force_full_reprocessing` every record is NEW and no store
    /// lookups are performed.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when a batched lookup fails.
    pub fn detect(
        &self,
        run_id: &RunId,
        source_id: &SourceId,
        records: &[ExtractedOpportunity],
        force_full_reprocessing: bool,
        now: Timestamp,
    ) -> Result<DetectionOutput, DatastoreError> {
        let started = now;
        if force_full_reprocessing {
            return Ok(Self::force_output(run_id, source_id, records, started));
        }

        let mut queries_made = 0_u64;
        let by_api_id = self.lookup_by_api_ids(source_id, records, &mut queries_made)?;
        let by_title = self.lookup_by_titles(source_id, records, &by_api_id, &mut queries_made)?;

        let mut output = DetectionOutput {
            new_opportunities: Vec::new(),
            opportunities_to_update: Vec::new(),
            opportunities_to_skip: Vec::new(),
            session: empty_session(run_id, source_id),
        };
        output.session.database_queries_made = queries_made;

        for record in records {
            self.classify_record(record, &by_api_id, &by_title, now, &mut output);
        }

        output.session.total_opportunities_checked = output.session.new_opportunities
            + output.session.duplicates_to_update
            + output.session.duplicates_to_skip
            + output.session.validation_failures;
        output.session.detection_time_ms = now.millis_since(started);
        Ok(output)
    }

    /// Classifies one record against the prefetched lookup maps.
    fn classify_record(
        &self,
        record: &ExtractedOpportunity,
        by_api_id: &BTreeMap<String, Opportunity>,
        by_title: &BTreeMap<String, Opportunity>,
        now: Timestamp,
        output: &mut DetectionOutput,
    ) {
        let api_id = record.trimmed_api_id();
        let title = record.trimmed_title();
        if api_id.is_none() && title.is_none() {
            output.session.validation_failures += 1;
            output.opportunities_to_skip.push(SkipRecord {
                api_record: record.clone(),
                existing: None,
                reason: REASON_VALIDATION_FAILURE.to_string(),
                method: None,
            });
            return;
        }

        let id_match = api_id.and_then(|id| by_api_id.get(id)).cloned();
        let matched = if let Some(existing) = id_match {
            Some((existing, DetectionMethod::IdMatch))
        } else {
            title
                .map(normalize_title)
                .and_then(|normalized| by_title.get(&normalized))
                .filter(|existing| {
                    // Title matches never override a distinct external id.
                    let candidate_id = existing.api_opportunity_id.trim();
                    !api_id.is_some_and(|id| !candidate_id.is_empty() && candidate_id != id)
                })
                .cloned()
                .map(|existing| (existing, DetectionMethod::TitleMatch))
        };

        let Some((existing, method)) = matched else {
            output.session.new_opportunities += 1;
            output.new_opportunities.push(record.clone());
            return;
        };

        match method {
            DetectionMethod::IdMatch => output.session.id_matches += 1,
            DetectionMethod::TitleMatch => output.session.title_matches += 1,
        }

        let window = i64::try_from(self.config.freshness_window_ms).unwrap_or(i64::MAX);
        let fresh =
            now.as_unix_millis().saturating_sub(existing.updated_at.as_unix_millis()) < window;
        if fresh {
            output.session.duplicates_to_skip += 1;
            output.session.freshness_skips += 1;
            output.opportunities_to_skip.push(SkipRecord {
                api_record: record.clone(),
                existing: Some(existing),
                reason: REASON_FRESH_NO_UPDATE_NEEDED.to_string(),
                method: Some(method),
            });
            return;
        }

        let changes = diff_material_fields(record, &existing);
        if changes.is_empty() {
            output.session.duplicates_to_skip += 1;
            output.opportunities_to_skip.push(SkipRecord {
                api_record: record.clone(),
                existing: Some(existing),
                reason: REASON_NO_CHANGES_DETECTED.to_string(),
                method: Some(method),
            });
        } else {
            output.session.duplicates_to_update += 1;
            output.opportunities_to_update.push(UpdateCandidate {
                api_record: record.clone(),
                existing,
                changes,
                reason: REASON_FIELDS_CHANGED.to_string(),
                method,
            });
        }
    }

    /// Batched lookup by external identifier.
    fn lookup_by_api_ids(
        &self,
        source_id: &SourceId,
        records: &[ExtractedOpportunity],
        queries_made: &mut u64,
    ) -> Result<BTreeMap<String, Opportunity>, DatastoreError> {
        let ids: Vec<String> = records
            .iter()
            .filter_map(|record| record.trimmed_api_id().map(str::to_string))
            .collect();
        let mut map = BTreeMap::new();
        for chunk in ids.chunks(LOOKUP_CHUNK_SIZE) {
            *queries_made += 1;
            for existing in self.store.find_by_api_ids(source_id, chunk)? {
                map.insert(existing.api_opportunity_id.trim().to_string(), existing);
            }
        }
        Ok(map)
    }

    /// Batched fallback lookup by normalized title for unmatched records.
    fn lookup_by_titles(
        &self,
        source_id: &SourceId,
        records: &[ExtractedOpportunity],
        by_api_id: &BTreeMap<String, Opportunity>,
        queries_made: &mut u64,
    ) -> Result<BTreeMap<String, Opportunity>, DatastoreError> {
        let titles: Vec<String> = records
            .iter()
            .filter(|record| {
                record.trimmed_api_id().is_none_or(|id| !by_api_id.contains_key(id))
            })
            .filter_map(|record| record.trimmed_title().map(normalize_title))
            .collect();
        let mut map = BTreeMap::new();
        for chunk in titles.chunks(LOOKUP_CHUNK_SIZE) {
            *queries_made += 1;
            for existing in self.store.find_by_normalized_titles(source_id, chunk)? {
                map.insert(existing.normalized_title(), existing);
            }
        }
        Ok(map)
    }

    /// Builds the all-NEW output for the force override.
    fn force_output(
        run_id: &RunId,
        source_id: &SourceId,
        records: &[ExtractedOpportunity],
        started: Timestamp,
    ) -> DetectionOutput {
        let mut session = empty_session(run_id, source_id);
        session.new_opportunities = u64::try_from(records.len()).unwrap_or(u64::MAX);
        session.total_opportunities_checked = session.new_opportunities;
        session.detection_time_ms = started.millis_since(started);
        DetectionOutput {
            new_opportunities: records.to_vec(),
            opportunities_to_update: Vec::new(),
            opportunities_to_skip: Vec::new(),
            session,
        }
    }
}

// ============================================================================
// SECTION: Field Diff
// ============================================================================

/// Computes the material-field diff between an extracted record and its
/// canonical row, in canonical field order.
#[must_use]
pub fn diff_material_fields(
    record: &ExtractedOpportunity,
    existing: &Opportunity,
) -> Vec<MaterialField> {
    MaterialField::ALL
        .into_iter()
        .filter(|field| !field_equal(*field, record, existing))
        .collect()
}

/// Compares one material field: both-null is equal, text compares after
/// trim, numbers compare after parsing, dates compare by instant.
fn field_equal(field: MaterialField, record: &ExtractedOpportunity, existing: &Opportunity) -> bool {
    match field {
        MaterialField::Title => {
            text_equal(record.title.as_deref(), Some(existing.title.as_str()))
        }
        MaterialField::Description => {
            text_equal(record.description.as_deref(), existing.description.as_deref())
        }
        MaterialField::CloseDate => record.close_date == existing.close_date,
        MaterialField::MinAward => number_equal(record.min_award, existing.min_award),
        MaterialField::MaxAward => number_equal(record.max_award, existing.max_award),
        MaterialField::TotalFunding => {
            number_equal(record.total_funding, existing.total_funding)
        }
        MaterialField::Eligibility => {
            text_equal(record.eligibility.as_deref(), existing.eligibility.as_deref())
        }
        MaterialField::Url => text_equal(record.url.as_deref(), existing.url.as_deref()),
    }
}

/// Text equality after trim; both-absent and absent-vs-blank are equal.
fn text_equal(left: Option<&str>, right: Option<&str>) -> bool {
    fn normalize(value: Option<&str>) -> Option<&str> {
        value.map(str::trim).filter(|text| !text.is_empty())
    }
    normalize(left) == normalize(right)
}

/// Numeric equality for parsed amounts; both-absent is equal.
fn number_equal(left: Option<f64>, right: Option<f64>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(a), Some(b)) => (a - b).abs() < 1e-9,
        _ => false,
    }
}

/// Builds a zeroed session for a run and source.
fn empty_session(run_id: &RunId, source_id: &SourceId) -> DuplicateDetectionSession {
    DuplicateDetectionSession {
        run_id: run_id.clone(),
        source_id: source_id.clone(),
        total_opportunities_checked: 0,
        new_opportunities: 0,
        duplicates_to_update: 0,
        duplicates_to_skip: 0,
        detection_time_ms: 0,
        database_queries_made: 0,
        id_matches: 0,
        title_matches: 0,
        validation_failures: 0,
        freshness_skips: 0,
    }
}
