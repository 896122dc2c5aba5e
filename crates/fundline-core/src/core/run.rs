// fundline-core/src/core/run.rs
// ============================================================================
// Module: Fundline Run Records
// Description: Run, stage, path, and detection-session bookkeeping records.
// Purpose: Capture per-run evolution for dashboards and offline verification.
// Dependencies: crate::core::{identifiers, opportunity, time}, serde, serde_json
// ============================================================================

//! ## Overview
//! A run owns its stage rows, per-opportunity paths, and duplicate-detection
//! session. Stage rows follow a fixed order and a strict status machine;
//! totals are monotonic within a run. These records are the canonical source
//! of truth for every derived dashboard view.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::JobId;
use crate::core::identifiers::OpportunityId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::SourceId;
use crate::core::opportunity::MaterialField;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Stage Names
// ============================================================================

/// Logical pipeline stages in fixed execution order.
///
/// # Invariants
/// - `stage_order` values are stable and dense per the pipeline contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Source analysis.
    SourceOrchestrator,
    /// Raw API fetch (optional sub-stage of extraction).
    ApiFetch,
    /// Data extraction and response mapping.
    DataExtraction,
    /// Early duplicate classification.
    EarlyDuplicateDetector,
    /// LM analysis of new records.
    Analysis,
    /// Deterministic filtering of analyzed records.
    Filter,
    /// Canonical storage of included records.
    Storage,
    /// Direct-update fast path for changed duplicates.
    DirectUpdate,
}

impl StageName {
    /// All stages in execution order.
    pub const ALL: [Self; 8] = [
        Self::SourceOrchestrator,
        Self::ApiFetch,
        Self::DataExtraction,
        Self::EarlyDuplicateDetector,
        Self::Analysis,
        Self::Filter,
        Self::Storage,
        Self::DirectUpdate,
    ];

    /// Returns the 1-based stage order.
    #[must_use]
    pub const fn stage_order(self) -> u8 {
        match self {
            Self::SourceOrchestrator => 1,
            Self::ApiFetch => 2,
            Self::DataExtraction => 3,
            Self::EarlyDuplicateDetector => 4,
            Self::Analysis => 5,
            Self::Filter => 6,
            Self::Storage => 7,
            Self::DirectUpdate => 8,
        }
    }

    /// Returns the snake_case stage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceOrchestrator => "source_orchestrator",
            Self::ApiFetch => "api_fetch",
            Self::DataExtraction => "data_extraction",
            Self::EarlyDuplicateDetector => "early_duplicate_detector",
            Self::Analysis => "analysis",
            Self::Filter => "filter",
            Self::Storage => "storage",
            Self::DirectUpdate => "direct_update",
        }
    }

    /// Parses a stage name from its snake_case form.
    #[must_use]
    pub fn from_str_tag(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == value)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Run Lifecycle
// ============================================================================

/// Run lifecycle status.
///
/// # Invariants
/// - `Completed` and `Failed` are terminal; a run takes exactly one terminal
///   transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run record created.
    Started,
    /// Stages are executing.
    Processing,
    /// Run finished successfully.
    Completed,
    /// Run finished with a failure.
    Failed,
}

impl RunStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Monotonic totals accumulated across a run.
///
/// # Invariants
/// - Values only increase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RunTotals {
    /// Opportunities stored or directly updated.
    pub opportunities_processed: u64,
    /// LM tokens consumed.
    pub tokens_used: u64,
    /// Outbound API calls made.
    pub api_calls: u64,
    /// Opportunities that bypassed the LM (updates plus skips).
    pub opportunities_bypassed_llm: u64,
    /// Estimated LM cost in USD.
    pub estimated_cost_usd: f64,
}

/// Letter grade derived from SLA compliance.
///
/// # Invariants
/// - Grades map to fixed compliance bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaGrade {
    /// Compliance >= 90.
    A,
    /// Compliance >= 80.
    B,
    /// Compliance >= 70.
    C,
    /// Compliance >= 60.
    D,
    /// Compliance < 60.
    F,
}

/// Metrics derived from run totals at completion or failure.
///
/// # Invariants
/// - Percentages are bounded to [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    /// Opportunities per minute, 2 decimals.
    pub opportunities_per_minute: f64,
    /// Tokens per opportunity, 2 decimals.
    pub tokens_per_opportunity: f64,
    /// Cost per opportunity in USD, 4 decimals.
    pub cost_per_opportunity_usd: f64,
    /// Success rate percentage.
    pub success_rate_percentage: f64,
    /// Weighted SLA compliance percentage.
    pub sla_compliance_percentage: f64,
    /// Letter grade for the compliance percentage.
    pub sla_grade: SlaGrade,
}

impl Default for DerivedMetrics {
    fn default() -> Self {
        Self {
            opportunities_per_minute: 0.0,
            tokens_per_opportunity: 0.0,
            cost_per_opportunity_usd: 0.0,
            success_rate_percentage: 100.0,
            sla_compliance_percentage: 0.0,
            sla_grade: SlaGrade::F,
        }
    }
}

/// One end-to-end coordinator invocation for one source.
///
/// # Invariants
/// - Exactly one terminal transition; `completed_at` is set iff terminal.
/// - Totals are monotonic within the run.
/// - `revision` increases by one on every store write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: RunId,
    /// Source being processed.
    pub source_id: SourceId,
    /// Pipeline version tag.
    pub pipeline_version: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Start time.
    pub started_at: Timestamp,
    /// Terminal time, set exactly once.
    pub completed_at: Option<Timestamp>,
    /// Total wall time in milliseconds.
    pub total_execution_time_ms: Option<u64>,
    /// Configuration snapshot captured at start.
    pub configuration: Value,
    /// Monotonic totals.
    pub totals: RunTotals,
    /// Derived metrics.
    pub derived: DerivedMetrics,
    /// Failure counts keyed by error category.
    pub failure_breakdown: BTreeMap<String, u64>,
    /// Final results blob written at completion.
    pub final_results: Option<Value>,
    /// Error details blob written at failure.
    pub error_details: Option<Value>,
    /// Set when the source lock could not be acquired.
    pub concurrent_processing_detected: bool,
    /// Set when force-full-reprocessing was in effect at start.
    pub force_full_reprocessing_used: bool,
    /// Optimistic-concurrency revision.
    pub revision: u64,
}

// ============================================================================
// SECTION: Stage Records
// ============================================================================

/// Stage lifecycle status.
///
/// # Invariants
/// - Transitions follow pending -> processing -> {completed|failed|skipped}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage row created, not yet entered.
    Pending,
    /// Stage is executing.
    Processing,
    /// Stage finished successfully.
    Completed,
    /// Stage finished with a failure.
    Failed,
    /// Stage was bypassed for lack of input.
    Skipped,
}

impl StageStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One retry attempt recorded against a stage.
///
/// # Invariants
/// - `attempt` is 1-based and monotonic within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number that failed.
    pub attempt: u32,
    /// Backoff delay before the next attempt, in milliseconds.
    pub delay_ms: u64,
    /// Classified failure reason.
    pub reason: String,
    /// Record time.
    pub recorded_at: Timestamp,
}

/// One execution of one logical stage within a run.
///
/// # Invariants
/// - At most one row per `(run_id, stage, job_id)`.
/// - `started_at` is stamped on first entry to `Processing`; `completed_at`
///   on the terminal status; `completed_at >= started_at`.
/// - `input_count` of stage N equals `output_count` of stage N-1 on the
///   main path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Owning run.
    pub run_id: RunId,
    /// Stage name.
    pub stage: StageName,
    /// 1-based stage order.
    pub stage_order: u8,
    /// Lifecycle status.
    pub status: StageStatus,
    /// First entry to processing.
    pub started_at: Option<Timestamp>,
    /// Terminal time.
    pub completed_at: Option<Timestamp>,
    /// Wall time in milliseconds.
    pub execution_time_ms: Option<u64>,
    /// Records entering the stage.
    pub input_count: u64,
    /// Records leaving the stage.
    pub output_count: u64,
    /// LM tokens consumed by the stage.
    pub tokens_used: u64,
    /// Outbound API calls made by the stage.
    pub api_calls_made: u64,
    /// Estimated stage cost in USD.
    pub estimated_cost_usd: f64,
    /// Stage results blob.
    pub stage_results: Option<Value>,
    /// Performance metrics blob.
    pub performance_metrics: Option<Value>,
    /// Retry attempts recorded against the stage.
    pub retry_history: Vec<RetryAttempt>,
    /// Optional job identifier for parallel sub-executions.
    pub job_id: Option<JobId>,
}

// ============================================================================
// SECTION: Opportunity Paths
// ============================================================================

/// Classification assigned by the early duplicate detector.
///
/// # Invariants
/// - Variants are stable for serialization and analytics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathType {
    /// Record is new to the canonical store.
    New,
    /// Record matches an existing row with material changes.
    Update,
    /// Record matches an existing row with no material changes.
    Skip,
}

/// Terminal outcome of one opportunity's journey through a run.
///
/// # Invariants
/// - Allowed combinations per path type: NEW -> stored, filtered_out, or
///   failed; UPDATE -> updated or failed; SKIP -> skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    /// Stored as a new canonical row.
    Stored,
    /// Canonical row updated in place.
    Updated,
    /// Dropped without store writes.
    Skipped,
    /// Excluded by the filter stage.
    FilteredOut,
    /// Failed during processing.
    Failed,
}

impl FinalOutcome {
    /// Returns true when this outcome is allowed for the given path type.
    #[must_use]
    pub const fn allowed_for(self, path_type: PathType) -> bool {
        match path_type {
            PathType::New => {
                matches!(self, Self::Stored | Self::FilteredOut | Self::Failed)
            }
            PathType::Update => matches!(self, Self::Updated | Self::Failed),
            PathType::Skip => matches!(self, Self::Skipped),
        }
    }
}

/// Method that established a duplicate match.
///
/// # Invariants
/// - Variants are stable for serialization and analytics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Matched by external identifier.
    IdMatch,
    /// Matched by normalized title.
    TitleMatch,
}

/// Analytics record for one extracted opportunity's journey.
///
/// # Invariants
/// - `final_outcome` is allowed for `path_type`.
/// - `stages_processed` lists stages in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityPath {
    /// Owning run.
    pub run_id: RunId,
    /// External identifier, empty when the record had none.
    pub api_opportunity_id: String,
    /// Record title, empty when the record had none.
    pub title: String,
    /// Owning source.
    pub source_id: SourceId,
    /// Detector classification.
    pub path_type: PathType,
    /// Human-readable classification reason.
    pub path_reason: String,
    /// Stages the record passed through, in order.
    pub stages_processed: Vec<StageName>,
    /// Terminal outcome.
    pub final_outcome: FinalOutcome,
    /// Tokens attributed to this record.
    pub tokens_used: u64,
    /// Wall time attributed to this record, in milliseconds.
    pub processing_time_ms: u64,
    /// Cost attributed to this record, in USD.
    pub cost_usd: f64,
    /// Whether a duplicate was detected.
    pub duplicate_detected: bool,
    /// Matched canonical row, when a duplicate was detected.
    pub existing_opportunity_id: Option<OpportunityId>,
    /// Material fields that differed, for UPDATE paths.
    pub changes_detected: Vec<MaterialField>,
    /// Match method, when a duplicate was detected.
    pub duplicate_detection_method: Option<DetectionMethod>,
    /// Analysis quality score, when the record was analyzed.
    pub quality_score: Option<f64>,
}

// ============================================================================
// SECTION: Detection Sessions
// ============================================================================

/// One early-duplicate-detector invocation within a run.
///
/// # Invariants
/// - `total_opportunities_checked == new_opportunities + duplicates_to_update
///   + duplicates_to_skip + validation_failures`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateDetectionSession {
    /// Owning run.
    pub run_id: RunId,
    /// Source being processed.
    pub source_id: SourceId,
    /// Records examined.
    pub total_opportunities_checked: u64,
    /// Records classified NEW.
    pub new_opportunities: u64,
    /// Records classified UPDATE.
    pub duplicates_to_update: u64,
    /// Records classified SKIP.
    pub duplicates_to_skip: u64,
    /// Detection wall time in milliseconds.
    pub detection_time_ms: u64,
    /// Store round-trips issued.
    pub database_queries_made: u64,
    /// Matches established by external identifier.
    pub id_matches: u64,
    /// Matches established by normalized title.
    pub title_matches: u64,
    /// Records rejected for missing identity fields.
    pub validation_failures: u64,
    /// Skips caused by the freshness window.
    pub freshness_skips: u64,
}

impl DuplicateDetectionSession {
    /// Records that bypassed LM processing: updates plus skips.
    #[must_use]
    pub const fn llm_processing_bypassed(&self) -> u64 {
        self.duplicates_to_update + self.duplicates_to_skip
    }
}
