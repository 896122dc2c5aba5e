// fundline-store-sqlite/tests/sqlite_store_unit.rs
// ============================================================================
// Module: SQLite Store Unit Tests
// Description: Durable datastore behavior across all nine tables.
// Purpose: Validate persistence, uniqueness, revisions, and advisory locks.
// ============================================================================

//! Store tests on temp-file databases: source CRUD with next-due ordering,
//! opportunity uniqueness and optimistic patches, run/stage/path/session
//! round-trips, advisory locks, flags, and raw responses.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::float_cmp,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::collections::BTreeMap;

use fundline_core::AuthDescriptor;
use fundline_core::Datastore;
use fundline_core::DerivedMetrics;
use fundline_core::DuplicateDetectionSession;
use fundline_core::FieldPatch;
use fundline_core::FieldValue;
use fundline_core::HandlerType;
use fundline_core::MaterialField;
use fundline_core::Opportunity;
use fundline_core::OpportunityId;
use fundline_core::OpportunityStore;
use fundline_core::Run;
use fundline_core::RunId;
use fundline_core::RunStatus;
use fundline_core::RunStore;
use fundline_core::RunTotals;
use fundline_core::RunWrite;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::SourceId;
use fundline_core::SourceStore;
use fundline_core::SourceType;
use fundline_core::StageName;
use fundline_core::StageRecord;
use fundline_core::StageStatus;
use fundline_core::SystemConfigStore;
use fundline_core::Timestamp;
use fundline_core::UpdateApplied;
use fundline_core::UpdateCadence;
use fundline_core::interfaces::AdvisoryLock;
use fundline_core::interfaces::RawResponseStore;
use fundline_store_sqlite::SqliteDatastore;
use fundline_store_sqlite::SqliteStoreConfig;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Base wall-clock instant for the tests.
const NOW_MS: i64 = 1_700_000_000_000;

/// Opens a store on a fresh temp-file database.
fn store() -> (SqliteDatastore, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = SqliteStoreConfig::new(dir.path().join("fundline.db"));
    (SqliteDatastore::open(&config).unwrap(), dir)
}

/// A source row with the given cadence and last-checked offset.
fn source(name: &str, cadence: UpdateCadence, checked_ago_ms: Option<i64>) -> Source {
    Source {
        source_id: SourceId::generate(),
        name: name.to_string(),
        organization: "Energy Office".to_string(),
        source_type: SourceType::State,
        url: "https://api.example.test".to_string(),
        api_endpoint: None,
        api_documentation_url: None,
        auth: AuthDescriptor::None,
        update_frequency: cadence,
        handler_type: HandlerType::Standard,
        notes: None,
        active: true,
        force_full_reprocessing: false,
        last_checked: checked_ago_ms
            .map(|ago| Timestamp::from_unix_millis(NOW_MS - ago)),
        created_at: Timestamp::from_unix_millis(NOW_MS),
        updated_at: Timestamp::from_unix_millis(NOW_MS),
    }
}

/// A canonical opportunity for the given source.
fn opportunity(source_id: &SourceId, api_id: &str, title: &str) -> Opportunity {
    Opportunity {
        opportunity_id: OpportunityId::generate(),
        source_id: source_id.clone(),
        api_opportunity_id: api_id.to_string(),
        title: title.to_string(),
        description: Some("desc".to_string()),
        funding_type: None,
        agency: None,
        min_award: Some(1_000.0),
        max_award: Some(5_000.0),
        total_funding: Some(100_000.0),
        open_date: None,
        close_date: None,
        eligibility: None,
        url: None,
        analysis: None,
        created_at: Timestamp::from_unix_millis(NOW_MS),
        updated_at: Timestamp::from_unix_millis(NOW_MS),
        revision: 1,
    }
}

/// A run row for the given source.
fn run(source_id: &SourceId) -> Run {
    Run {
        run_id: RunId::generate(),
        source_id: source_id.clone(),
        pipeline_version: "v2".to_string(),
        status: RunStatus::Started,
        started_at: Timestamp::from_unix_millis(NOW_MS),
        completed_at: None,
        total_execution_time_ms: None,
        configuration: json!({}),
        totals: RunTotals::default(),
        derived: DerivedMetrics::default(),
        failure_breakdown: BTreeMap::new(),
        final_results: None,
        error_details: None,
        concurrent_processing_detected: false,
        force_full_reprocessing_used: false,
        revision: 1,
    }
}

// ============================================================================
// SECTION: Sources
// ============================================================================

#[test]
fn source_round_trip_and_duplicate_rejection() {
    let (store, _dir) = store();
    let source = source("Grants", UpdateCadence::Daily, None);
    store.insert_source(&source, &SourceConfiguration::default()).unwrap();

    let loaded = store.get_source(&source.source_id).unwrap().unwrap();
    assert_eq!(loaded, source);
    assert!(store.get_configuration(&source.source_id).unwrap().is_some());
    assert!(store.insert_source(&source, &SourceConfiguration::default()).is_err());
}

#[test]
fn next_due_prefers_never_checked_then_oldest() {
    let (store, _dir) = store();
    let never = source("Never Checked", UpdateCadence::Daily, None);
    let stale = source("Stale", UpdateCadence::Daily, Some(172_800_000));
    let fresh = source("Fresh", UpdateCadence::Daily, Some(60_000));
    for row in [&never, &stale, &fresh] {
        store.insert_source(row, &SourceConfiguration::default()).unwrap();
    }

    let now = Timestamp::from_unix_millis(NOW_MS);
    let first = store.next_due_source(now).unwrap().unwrap();
    assert_eq!(first.source_id, never.source_id);

    store.stamp_last_checked(&never.source_id, now).unwrap();
    let second = store.next_due_source(now).unwrap().unwrap();
    assert_eq!(second.source_id, stale.source_id);

    store.stamp_last_checked(&stale.source_id, now).unwrap();
    assert!(store.next_due_source(now).unwrap().is_none(), "fresh source is not due");
}

#[test]
fn force_flag_persists_through_the_source_row() {
    let (store, _dir) = store();
    let source = source("Grants", UpdateCadence::Daily, None);
    store.insert_source(&source, &SourceConfiguration::default()).unwrap();
    store.set_force_full_reprocessing(&source.source_id, true).unwrap();
    assert!(store.get_source(&source.source_id).unwrap().unwrap().force_full_reprocessing);
    store.set_force_full_reprocessing(&source.source_id, false).unwrap();
    assert!(!store.get_source(&source.source_id).unwrap().unwrap().force_full_reprocessing);
}

// ============================================================================
// SECTION: Opportunities
// ============================================================================

#[test]
fn opportunity_uniqueness_is_scoped_to_the_source() {
    let (store, _dir) = store();
    let source_a = SourceId::generate();
    let source_b = SourceId::generate();
    store.insert_opportunity(&opportunity(&source_a, "A1", "Solar")).unwrap();
    // Same external id under another source is fine.
    store.insert_opportunity(&opportunity(&source_b, "A1", "Solar")).unwrap();
    // Same (source, external id) is rejected.
    assert!(store.insert_opportunity(&opportunity(&source_a, "A1", "Other")).is_err());
}

#[test]
fn batched_lookups_match_ids_and_normalized_titles() {
    let (store, _dir) = store();
    let source_id = SourceId::generate();
    store.insert_opportunity(&opportunity(&source_id, "A1", "Solar  Retrofit Grant")).unwrap();
    store.insert_opportunity(&opportunity(&source_id, "A2", "Wind Grant")).unwrap();

    let by_id = store
        .find_by_api_ids(&source_id, &["A1".to_string(), "A9".to_string()])
        .unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].api_opportunity_id, "A1");

    let by_title = store
        .find_by_normalized_titles(&source_id, &["solar retrofit grant".to_string()])
        .unwrap();
    assert_eq!(by_title.len(), 1);
    assert_eq!(by_title[0].api_opportunity_id, "A1");
}

#[test]
fn field_patches_respect_the_revision_guard() {
    let (store, _dir) = store();
    let source_id = SourceId::generate();
    let row = opportunity(&source_id, "A1", "Solar");
    store.insert_opportunity(&row).unwrap();

    let patches = vec![FieldPatch {
        field: MaterialField::TotalFunding,
        value: FieldValue::Number(Some(250_000.0)),
    }];
    let applied = store
        .apply_field_patches(
            &row.opportunity_id,
            &patches,
            1,
            Timestamp::from_unix_millis(NOW_MS + 1_000),
        )
        .unwrap();
    assert_eq!(applied, UpdateApplied::Applied);

    let reloaded = store.get_opportunity(&row.opportunity_id).unwrap().unwrap();
    assert_eq!(reloaded.total_funding, Some(250_000.0));
    assert_eq!(reloaded.revision, 2);

    // A stale revision observes a conflict, not a write.
    let conflict = store
        .apply_field_patches(
            &row.opportunity_id,
            &patches,
            1,
            Timestamp::from_unix_millis(NOW_MS + 2_000),
        )
        .unwrap();
    assert_eq!(conflict, UpdateApplied::VersionConflict);

    let missing = store
        .apply_field_patches(
            &OpportunityId::generate(),
            &patches,
            1,
            Timestamp::from_unix_millis(NOW_MS + 2_000),
        )
        .unwrap();
    assert_eq!(missing, UpdateApplied::Missing);
}

// ============================================================================
// SECTION: Runs, Stages, Paths, Sessions
// ============================================================================

#[test]
fn run_updates_use_optimistic_revisions() {
    let (store, _dir) = store();
    let source_id = SourceId::generate();
    let mut row = run(&source_id);
    store.insert_run(&row).unwrap();
    assert!(store.insert_run(&row).is_err(), "duplicate run ids are rejected");

    row.status = RunStatus::Processing;
    row.revision = 2;
    assert_eq!(store.update_run(&row, 1).unwrap(), RunWrite::Applied);
    assert_eq!(store.update_run(&row, 1).unwrap(), RunWrite::Conflict);

    let loaded = store.load_run(&row.run_id).unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::Processing);
    assert_eq!(loaded.revision, 2);
}

#[test]
fn stage_rows_upsert_by_run_stage_and_job() {
    let (store, _dir) = store();
    let source_id = SourceId::generate();
    let row = run(&source_id);
    store.insert_run(&row).unwrap();

    let mut stage = StageRecord {
        run_id: row.run_id.clone(),
        stage: StageName::DataExtraction,
        stage_order: StageName::DataExtraction.stage_order(),
        status: StageStatus::Processing,
        started_at: Some(Timestamp::from_unix_millis(NOW_MS)),
        completed_at: None,
        execution_time_ms: None,
        input_count: 1,
        output_count: 0,
        tokens_used: 0,
        api_calls_made: 0,
        estimated_cost_usd: 0.0,
        stage_results: None,
        performance_metrics: None,
        retry_history: Vec::new(),
        job_id: None,
    };
    store.upsert_stage(&stage).unwrap();
    stage.status = StageStatus::Completed;
    stage.output_count = 5;
    store.upsert_stage(&stage).unwrap();

    let stages = store.load_stages(&row.run_id).unwrap();
    assert_eq!(stages.len(), 1, "upsert replaces the same stage key");
    assert_eq!(stages[0].status, StageStatus::Completed);
    assert_eq!(stages[0].output_count, 5);
}

#[test]
fn detection_sessions_are_unique_per_run() {
    let (store, _dir) = store();
    let source_id = SourceId::generate();
    let row = run(&source_id);
    store.insert_run(&row).unwrap();
    let session = DuplicateDetectionSession {
        run_id: row.run_id.clone(),
        source_id,
        total_opportunities_checked: 3,
        new_opportunities: 1,
        duplicates_to_update: 1,
        duplicates_to_skip: 1,
        detection_time_ms: 4,
        database_queries_made: 2,
        id_matches: 2,
        title_matches: 0,
        validation_failures: 0,
        freshness_skips: 1,
    };
    store.insert_detection_session(&session).unwrap();
    assert!(store.insert_detection_session(&session).is_err());
    let loaded = store.load_detection_session(&row.run_id).unwrap().unwrap();
    assert_eq!(loaded, session);
}

#[test]
fn unfinished_runs_list_by_cutoff() {
    let (store, _dir) = store();
    let source_id = SourceId::generate();
    let stuck = run(&source_id);
    store.insert_run(&stuck).unwrap();
    let mut done = run(&source_id);
    done.status = RunStatus::Completed;
    store.insert_run(&done).unwrap();

    let cutoff = Timestamp::from_unix_millis(NOW_MS);
    let unfinished = store.list_unfinished_runs(cutoff).unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].run_id, stuck.run_id);

    let earlier = Timestamp::from_unix_millis(NOW_MS - 1);
    assert!(store.list_unfinished_runs(earlier).unwrap().is_empty());
}

// ============================================================================
// SECTION: Locks, Flags, Raw Responses
// ============================================================================

#[test]
fn advisory_locks_exclude_and_release() {
    let (store, _dir) = store();
    let key = 123_456;
    let handle = store.try_acquire(key).unwrap().unwrap();
    assert!(store.try_acquire(key).unwrap().is_none(), "held keys are exclusive");
    store.release(&handle).unwrap();
    assert!(store.try_acquire(key).unwrap().is_some(), "released keys can be reacquired");
}

#[test]
fn system_flags_round_trip() {
    let (store, _dir) = store();
    assert_eq!(store.get_flag("global_force_full_reprocessing").unwrap(), None);
    store.set_flag("global_force_full_reprocessing", true).unwrap();
    assert_eq!(store.get_flag("global_force_full_reprocessing").unwrap(), Some(true));
    store.set_flag("global_force_full_reprocessing", false).unwrap();
    assert_eq!(store.get_flag("global_force_full_reprocessing").unwrap(), Some(false));
}

#[test]
fn raw_responses_store_by_reference() {
    let (store, _dir) = store();
    let source_id = SourceId::generate();
    let body = json!({ "data": { "items": [] } });
    let reference = store
        .store_raw_response(&source_id, &body, Timestamp::from_unix_millis(NOW_MS))
        .unwrap();
    let loaded = store.load_raw_response(&reference).unwrap().unwrap();
    assert_eq!(loaded.body, body);
    assert_eq!(loaded.source_id, source_id);
    assert!(store.load_raw_response("raw-missing").unwrap().is_none());
}

#[test]
fn readiness_probes_the_connection() {
    let (store, _dir) = store();
    store.readiness().unwrap();
}
