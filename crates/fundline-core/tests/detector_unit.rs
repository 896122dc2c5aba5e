// fundline-core/tests/detector_unit.rs
// ============================================================================
// Module: Early Duplicate Detector Unit Tests
// Description: NEW / UPDATE / SKIP classification and session accounting.
// Purpose: Validate lookup order, freshness, diffs, and the force override.
// ============================================================================

//! Detector tests over the in-memory datastore: identity validation,
//! id-first matching, normalized-title fallback, the freshness window,
//! material-field diffs, and the all-NEW force path.

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

use fundline_core::ExtractedOpportunity;
use fundline_core::MaterialField;
use fundline_core::Opportunity;
use fundline_core::OpportunityId;
use fundline_core::OpportunityStore;
use fundline_core::RunId;
use fundline_core::SourceId;
use fundline_core::Timestamp;
use fundline_core::runtime::DetectorConfig;
use fundline_core::runtime::EarlyDuplicateDetector;
use fundline_core::runtime::InMemoryDatastore;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Base wall-clock instant for the tests.
const NOW_MS: i64 = 1_700_000_000_000;

/// Builds an extracted record with an id and title.
fn extracted(api_id: &str, title: &str) -> ExtractedOpportunity {
    ExtractedOpportunity {
        api_opportunity_id: Some(api_id.to_string()),
        title: Some(title.to_string()),
        ..ExtractedOpportunity::default()
    }
}

/// Builds a canonical row updated at the given offset before now.
fn canonical(source_id: &SourceId, api_id: &str, title: &str, age_ms: i64) -> Opportunity {
    Opportunity {
        opportunity_id: OpportunityId::generate(),
        source_id: source_id.clone(),
        api_opportunity_id: api_id.to_string(),
        title: title.to_string(),
        description: None,
        funding_type: None,
        agency: None,
        min_award: None,
        max_award: None,
        total_funding: None,
        open_date: None,
        close_date: None,
        eligibility: None,
        url: None,
        analysis: None,
        created_at: Timestamp::from_unix_millis(NOW_MS - age_ms),
        updated_at: Timestamp::from_unix_millis(NOW_MS - age_ms),
        revision: 1,
    }
}

/// Detector with the default 24-hour freshness window.
fn detect(
    store: &InMemoryDatastore,
    source_id: &SourceId,
    records: &[ExtractedOpportunity],
    force: bool,
) -> fundline_core::runtime::DetectionOutput {
    let detector = EarlyDuplicateDetector::new(store, DetectorConfig::default());
    detector
        .detect(
            &RunId::generate(),
            source_id,
            records,
            force,
            Timestamp::from_unix_millis(NOW_MS),
        )
        .unwrap()
}

// ============================================================================
// SECTION: Validation and NEW
// ============================================================================

#[test]
fn blank_identity_counts_as_validation_failure() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    let records = vec![
        ExtractedOpportunity::default(),
        ExtractedOpportunity {
            api_opportunity_id: Some("  ".to_string()),
            title: Some("".to_string()),
            ..ExtractedOpportunity::default()
        },
        extracted("A1", "Solar Grant"),
    ];
    let output = detect(&store, &source_id, &records, false);
    assert_eq!(output.session.validation_failures, 2);
    assert_eq!(output.session.new_opportunities, 1);
    assert_eq!(output.session.total_opportunities_checked, 3);
    assert_eq!(output.opportunities_to_skip.len(), 2);
    assert_eq!(
        output.opportunities_to_skip[0].reason,
        "validation_failure"
    );
}

#[test]
fn unmatched_records_are_new() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    let records = vec![extracted("A1", "Solar Grant"), extracted("A2", "Wind Grant")];
    let output = detect(&store, &source_id, &records, false);
    assert_eq!(output.session.new_opportunities, 2);
    assert_eq!(output.session.duplicates_to_update, 0);
    assert_eq!(output.session.duplicates_to_skip, 0);
    assert_eq!(output.new_opportunities.len(), 2);
}

// ============================================================================
// SECTION: Freshness and Diffs
// ============================================================================

#[test]
fn fresh_rows_skip_without_a_diff() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    // Updated one hour ago, well inside the 24-hour window.
    store.insert_opportunity(&canonical(&source_id, "A1", "Solar Grant", 3_600_000)).unwrap();
    let mut record = extracted("A1", "Solar Grant Renamed");
    record.total_funding = Some(1_000_000.0);
    let output = detect(&store, &source_id, &[record], false);
    assert_eq!(output.session.duplicates_to_skip, 1);
    assert_eq!(output.session.freshness_skips, 1);
    assert_eq!(output.opportunities_to_skip[0].reason, "fresh_no_update_needed");
}

#[test]
fn stale_unchanged_rows_skip_with_no_changes() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    store.insert_opportunity(&canonical(&source_id, "A1", "Solar Grant", 172_800_000)).unwrap();
    let output = detect(&store, &source_id, &[extracted("A1", "  Solar Grant  ")], false);
    assert_eq!(output.session.duplicates_to_skip, 1);
    assert_eq!(output.session.freshness_skips, 0);
    assert_eq!(output.opportunities_to_skip[0].reason, "no_changes_detected");
}

#[test]
fn stale_changed_rows_update_with_the_changed_fields() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    let mut existing = canonical(&source_id, "A1", "Solar Grant", 172_800_000);
    existing.total_funding = Some(500_000.0);
    store.insert_opportunity(&existing).unwrap();

    let mut record = extracted("A1", "Solar Grant");
    record.total_funding = Some(750_000.0);
    record.close_date = Some(Timestamp::from_unix_millis(NOW_MS + 86_400_000));
    let output = detect(&store, &source_id, &[record], false);
    assert_eq!(output.session.duplicates_to_update, 1);
    assert_eq!(output.session.id_matches, 1);
    let candidate = &output.opportunities_to_update[0];
    assert_eq!(candidate.changes, vec![MaterialField::CloseDate, MaterialField::TotalFunding]);
    assert_eq!(candidate.reason, "fields_changed");
}

// ============================================================================
// SECTION: Title Fallback
// ============================================================================

#[test]
fn title_fallback_matches_when_the_id_is_blank() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    store.insert_opportunity(&canonical(&source_id, "A1", "Solar  Grant", 172_800_000)).unwrap();
    let record = ExtractedOpportunity {
        api_opportunity_id: None,
        title: Some("Solar  Grant".to_string()),
        ..ExtractedOpportunity::default()
    };
    let output = detect(&store, &source_id, &[record], false);
    assert_eq!(output.session.title_matches, 1);
    assert_eq!(output.session.duplicates_to_skip, 1);
}

#[test]
fn title_match_never_overrides_a_distinct_id() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    store.insert_opportunity(&canonical(&source_id, "B7", "Solar Grant", 172_800_000)).unwrap();
    // Same title, different non-blank external id: must stay NEW.
    let output = detect(&store, &source_id, &[extracted("A1", "Solar Grant")], false);
    assert_eq!(output.session.new_opportunities, 1);
    assert_eq!(output.session.title_matches, 0);
}

// ============================================================================
// SECTION: Force Override and Sessions
// ============================================================================

#[test]
fn force_marks_everything_new_without_lookups() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    store.insert_opportunity(&canonical(&source_id, "A1", "Solar Grant", 3_600_000)).unwrap();
    let records = vec![extracted("A1", "Solar Grant"), extracted("A2", "Wind Grant")];
    let output = detect(&store, &source_id, &records, true);
    assert_eq!(output.session.new_opportunities, 2);
    assert_eq!(output.session.database_queries_made, 0);
    assert!(output.opportunities_to_update.is_empty());
    assert!(output.opportunities_to_skip.is_empty());
}

#[test]
fn session_totals_reconcile() {
    let store = InMemoryDatastore::new();
    let source_id = SourceId::generate();
    store.insert_opportunity(&canonical(&source_id, "A1", "Solar Grant", 172_800_000)).unwrap();
    let mut changed = extracted("A1", "Solar Grant");
    changed.url = Some("https://grants.example.test/a1".to_string());
    let records = vec![
        changed,
        extracted("A2", "Wind Grant"),
        ExtractedOpportunity::default(),
    ];
    let output = detect(&store, &source_id, &records, false);
    let session = &output.session;
    assert_eq!(
        session.total_opportunities_checked,
        session.new_opportunities
            + session.duplicates_to_update
            + session.duplicates_to_skip
            + session.validation_failures
    );
    assert_eq!(session.llm_processing_bypassed(), 1);
    assert!(session.database_queries_made >= 1);
}
