// fundline-agents/tests/agents_unit.rs
// ============================================================================
// Module: Agent Unit Tests
// Description: Analyzer, analysis, filter, and storage agent behavior.
// Purpose: Validate collaborator contracts without any network dependency.
// ============================================================================

//! Agent tests: endpoint selection, LM-backed and heuristic analysis,
//! threshold filtering, and idempotent storage against the in-memory store.

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

use std::sync::Arc;

use fundline_agents::ConfiguredSourceAnalyzer;
use fundline_agents::DatastoreStorageAgent;
use fundline_agents::HeuristicAnalysisAgent;
use fundline_agents::LmAnalysisAgent;
use fundline_agents::ScoreThresholdFilter;
use fundline_agents::ScriptedLanguageModel;
use fundline_core::AuthDescriptor;
use fundline_core::ExtractedOpportunity;
use fundline_core::HandlerType;
use fundline_core::ManualClock;
use fundline_core::OpportunityAnalysis;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::SourceId;
use fundline_core::SourceType;
use fundline_core::Timestamp;
use fundline_core::UpdateCadence;
use fundline_core::interfaces::AnalysisAgent;
use fundline_core::interfaces::AnalysisError;
use fundline_core::interfaces::AnalyzedOpportunity;
use fundline_core::interfaces::OpportunityFilter;
use fundline_core::interfaces::SourceAnalyzer;
use fundline_core::interfaces::StorageAgent;
use fundline_core::interfaces::WorkflowKind;
use fundline_core::runtime::InMemoryDatastore;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Base wall-clock instant for the tests.
const NOW_MS: i64 = 1_700_000_000_000;

/// Source with an explicit endpoint and no detail configuration.
fn source() -> Source {
    Source {
        source_id: SourceId::generate(),
        name: "Grants API".to_string(),
        organization: "Energy Office".to_string(),
        source_type: SourceType::Federal,
        url: "https://api.example.test".to_string(),
        api_endpoint: Some("/v2/opportunities".to_string()),
        api_documentation_url: None,
        auth: AuthDescriptor::None,
        update_frequency: UpdateCadence::Daily,
        handler_type: HandlerType::Standard,
        notes: None,
        active: true,
        force_full_reprocessing: false,
        last_checked: None,
        created_at: Timestamp::from_unix_millis(NOW_MS),
        updated_at: Timestamp::from_unix_millis(NOW_MS),
    }
}

/// Record with a title and close/open dates.
fn record(api_id: &str, title: &str) -> ExtractedOpportunity {
    ExtractedOpportunity {
        api_opportunity_id: Some(api_id.to_string()),
        title: Some(title.to_string()),
        description: Some("desc".to_string()),
        open_date: Some(Timestamp::from_unix_millis(NOW_MS)),
        close_date: Some(Timestamp::from_unix_millis(NOW_MS + 86_400_000)),
        ..ExtractedOpportunity::default()
    }
}

/// Wraps a record with a fixed-score analysis.
fn analyzed(api_id: &str, title: &str, score: f64) -> AnalyzedOpportunity {
    AnalyzedOpportunity {
        record: record(api_id, title),
        analysis: OpportunityAnalysis {
            relevance_score: score,
            categories: Vec::new(),
            summary: String::new(),
            model: "test".to_string(),
            tokens_used: 10,
        },
    }
}

// ============================================================================
// SECTION: Analyzer
// ============================================================================

#[test]
fn analyzer_joins_relative_endpoints_onto_the_base_url() {
    let analyzer = ConfiguredSourceAnalyzer::heuristic();
    let analysis = analyzer.analyze(&source(), &SourceConfiguration::default()).unwrap();
    assert_eq!(analysis.endpoint, "https://api.example.test/v2/opportunities");
    assert_eq!(analysis.workflow, WorkflowKind::SinglePass);
    assert_eq!(analysis.token_usage, 0);
}

#[test]
fn analyzer_accepts_a_model_confidence() {
    let lm = Arc::new(ScriptedLanguageModel::new([]));
    lm.push("0.42", 25);
    let analyzer = ConfiguredSourceAnalyzer::with_model(lm);
    let analysis = analyzer.analyze(&source(), &SourceConfiguration::default()).unwrap();
    assert_eq!(analysis.confidence, 0.42);
    assert_eq!(analysis.token_usage, 25);
    assert_eq!(analysis.api_calls, 1);
}

// ============================================================================
// SECTION: Analysis Agents
// ============================================================================

#[test]
fn lm_analysis_parses_scoring_json_in_order() {
    let lm = Arc::new(ScriptedLanguageModel::new([]));
    lm.push(
        "{\"relevance_score\": 7.5, \"categories\": [\"solar\"], \"summary\": \"great\"}",
        120,
    );
    lm.push("{\"relevance_score\": 3.0, \"categories\": [], \"summary\": \"meh\"}", 80);
    let agent = LmAnalysisAgent::new(lm, "test-model");
    let output = agent
        .enhance(&[record("A1", "Solar"), record("A2", "Wind")], &source())
        .unwrap();
    assert_eq!(output.opportunities.len(), 2);
    assert_eq!(output.opportunities[0].analysis.relevance_score, 7.5);
    assert_eq!(output.opportunities[1].analysis.relevance_score, 3.0);
    assert_eq!(output.metrics.total_tokens, 200);
    assert_eq!(output.metrics.total_api_calls, 2);
}

#[test]
fn lm_analysis_rejects_missing_scoring() {
    let lm = Arc::new(ScriptedLanguageModel::new([]));
    lm.push("not json at all", 10);
    let agent = LmAnalysisAgent::new(lm, "test-model");
    let err = agent.enhance(&[record("A1", "Solar")], &source()).unwrap_err();
    assert!(matches!(err, AnalysisError::MissingScoring(_)), "{err}");
}

#[test]
fn heuristic_analysis_scores_by_completeness() {
    let agent = HeuristicAnalysisAgent;
    let sparse = ExtractedOpportunity {
        api_opportunity_id: Some("A1".to_string()),
        title: Some("Solar".to_string()),
        ..ExtractedOpportunity::default()
    };
    let output = agent.enhance(&[sparse, record("A2", "Wind")], &source()).unwrap();
    assert!(output.opportunities[0].analysis.relevance_score
        < output.opportunities[1].analysis.relevance_score);
    assert_eq!(output.metrics.total_tokens, 0);
}

// ============================================================================
// SECTION: Filter
// ============================================================================

#[test]
fn threshold_filter_is_deterministic_and_order_preserving() {
    let filter = ScoreThresholdFilter::default();
    let batch = vec![
        analyzed("A1", "Keep One", 9.0),
        analyzed("A2", "Drop", 4.9),
        analyzed("A3", "Keep Two", 5.0),
    ];
    let first = filter.filter(batch.clone()).unwrap();
    let second = filter.filter(batch).unwrap();
    assert_eq!(first.metrics.included, 2);
    assert_eq!(first.metrics.excluded, 1);
    let ids: Vec<&str> = first
        .included_opportunities
        .iter()
        .map(|analyzed| analyzed.record.api_opportunity_id.as_deref().unwrap())
        .collect();
    assert_eq!(ids, vec!["A1", "A3"]);
    assert_eq!(first.included_opportunities, second.included_opportunities);
}

// ============================================================================
// SECTION: Storage Agent
// ============================================================================

#[test]
fn storage_inserts_then_refreshes_idempotently() {
    let store = InMemoryDatastore::new();
    let clock = ManualClock::starting_at(Timestamp::from_unix_millis(NOW_MS));
    let agent = DatastoreStorageAgent::new(Arc::new(store.clone()), Arc::new(clock.clone()));
    let source = source();
    let batch = vec![analyzed("A1", "Solar", 8.0), analyzed("A2", "Wind", 8.0)];

    let first = agent.store(&batch, &source, false).unwrap();
    assert_eq!(first.metrics.new_opportunities, 2);
    assert_eq!(first.stored_api_ids, vec!["A1", "A2"]);

    // Re-storing the same external ids refreshes in place.
    clock.advance_millis(1_000);
    let second = agent.store(&batch, &source, true).unwrap();
    assert_eq!(second.metrics.new_opportunities, 0);
    assert_eq!(second.metrics.updated, 2);
    assert_eq!(store.all_opportunities().unwrap().len(), 2);
}

#[test]
fn storage_rejects_invalid_canonical_rows() {
    let store = InMemoryDatastore::new();
    let clock = ManualClock::starting_at(Timestamp::from_unix_millis(NOW_MS));
    let agent = DatastoreStorageAgent::new(Arc::new(store.clone()), Arc::new(clock));
    let source = source();

    let mut inverted = analyzed("A1", "Backwards", 8.0);
    inverted.record.open_date = Some(Timestamp::from_unix_millis(NOW_MS + 86_400_000));
    inverted.record.close_date = Some(Timestamp::from_unix_millis(NOW_MS));
    let untitled = AnalyzedOpportunity {
        record: ExtractedOpportunity {
            api_opportunity_id: Some("A2".to_string()),
            ..ExtractedOpportunity::default()
        },
        analysis: inverted.analysis.clone(),
    };

    let outcome = agent.store(&[inverted, untitled], &source, false).unwrap();
    assert_eq!(outcome.metrics.failed, 2);
    assert_eq!(outcome.metrics.new_opportunities, 0);
    assert!(store.all_opportunities().unwrap().is_empty());
}
