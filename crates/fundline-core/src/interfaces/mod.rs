// fundline-core/src/interfaces/mod.rs
// ============================================================================
// Module: Fundline Interfaces
// Description: Backend-agnostic contracts for agents, the LM client, and the datastore.
// Purpose: Define the collaborator surfaces used by the Fundline runtime.
// Dependencies: crate::core, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Interfaces define how the pipeline integrates with external systems
//! without embedding backend specifics. Agents never know about each other;
//! the coordinator is the only component that sequences them. Implementations
//! must be deterministic for identical inputs and fail closed on missing or
//! invalid data.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::AttemptFailure;
use crate::core::DuplicateDetectionSession;
use crate::core::ExtractedOpportunity;
use crate::core::FieldPatch;
use crate::core::Opportunity;
use crate::core::OpportunityAnalysis;
use crate::core::OpportunityId;
use crate::core::OpportunityPath;
use crate::core::RawResponse;
use crate::core::Run;
use crate::core::RunId;
use crate::core::Source;
use crate::core::SourceConfiguration;
use crate::core::SourceId;
use crate::core::StageRecord;
use crate::core::Timestamp;

// ============================================================================
// SECTION: Source Analyzer
// ============================================================================

/// Extraction workflow selected by source analysis.
///
/// # Invariants
/// - Variants are stable for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Single list call per page.
    SinglePass,
    /// List call followed by per-item detail calls.
    TwoStep,
}

/// Result of analyzing a source ahead of extraction.
///
/// # Invariants
/// - `confidence` lies in [0, 1].
/// - The analyzer never mutates the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAnalysis {
    /// Effective endpoint the extractor should call.
    pub endpoint: String,
    /// Selected extraction workflow.
    pub workflow: WorkflowKind,
    /// Analyzer confidence in [0, 1].
    pub confidence: f64,
    /// LM tokens consumed by analysis.
    pub token_usage: u64,
    /// Outbound API calls made by analysis.
    pub api_calls: u64,
    /// Analysis wall time in milliseconds.
    pub execution_time_ms: u64,
}

/// Source analyzer errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// Source description is unusable.
    #[error("source analysis validation failed: {0}")]
    Invalid(String),
    /// LM call failed.
    #[error("source analysis model call failed: {0}")]
    Model(String),
}

impl From<AnalyzerError> for AttemptFailure {
    fn from(err: AnalyzerError) -> Self {
        Self::message(err.to_string())
    }
}

/// Analyzes a source description ahead of extraction.
pub trait SourceAnalyzer: Send + Sync {
    /// Produces an analysis for the source and its configuration bundle.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError`] when the source cannot be analyzed.
    fn analyze(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
    ) -> Result<SourceAnalysis, AnalyzerError>;
}

// ============================================================================
// SECTION: Data Extractor
// ============================================================================

/// Metrics reported by one extraction pass.
///
/// # Invariants
/// - `total_retrieved` equals the number of opportunities returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtractionMetrics {
    /// Records the upstream API reports as available.
    pub total_found: u64,
    /// Records actually retrieved this pass.
    pub total_retrieved: u64,
    /// Outbound API calls made.
    pub api_calls: u64,
    /// LM tokens consumed.
    pub total_tokens: u64,
    /// Extraction wall time in milliseconds.
    pub execution_time_ms: u64,
}

/// Result of one extraction pass.
///
/// # Invariants
/// - Opportunities are keyed by external identifier where the upstream
///   provides one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractionOutput {
    /// Extracted records after response mapping.
    pub opportunities: Vec<ExtractedOpportunity>,
    /// Stored raw-response reference, when capture is enabled.
    pub raw_response_id: Option<String>,
    /// Extraction metrics.
    pub metrics: ExtractionMetrics,
}

/// Data extractor errors.
///
/// # Invariants
/// - `Http` carries the response status for retryability classification.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Upstream returned a non-success status.
    #[error("api fetch failed with http status {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response summary.
        message: String,
    },
    /// Network-level failure.
    #[error("api fetch network failure: {0}")]
    Network(String),
    /// Response could not be interpreted.
    #[error("extraction validation failed: {0}")]
    Invalid(String),
    /// Response exceeded configured size limits.
    #[error("api response exceeds size limit: {0}")]
    TooLarge(String),
}

impl From<ExtractError> for AttemptFailure {
    fn from(err: ExtractError) -> Self {
        match &err {
            ExtractError::Http {
                status, ..
            } => Self::http(err.to_string(), *status),
            ExtractError::Network(_) | ExtractError::Invalid(_) | ExtractError::TooLarge(_) => {
                Self::message(err.to_string())
            }
        }
    }
}

/// Fetches and maps upstream records per the source configuration.
pub trait DataExtractor: Send + Sync {
    /// Extracts a batch of opportunities, handling pagination and detail
    /// fan-out per the configuration bundle.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] when the upstream cannot be read or mapped.
    fn extract(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
        analysis: &SourceAnalysis,
    ) -> Result<ExtractionOutput, ExtractError>;
}

// ============================================================================
// SECTION: Analysis Agent
// ============================================================================

/// One record paired with its LM analysis.
///
/// # Invariants
/// - Output order matches input order across the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedOpportunity {
    /// Extracted record.
    pub record: ExtractedOpportunity,
    /// LM analysis fields.
    pub analysis: OpportunityAnalysis,
}

/// Metrics reported by one analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AnalysisMetrics {
    /// LM tokens consumed.
    pub total_tokens: u64,
    /// LM API calls made.
    pub total_api_calls: u64,
    /// Analysis wall time in milliseconds.
    pub total_execution_time_ms: u64,
}

/// Result of one analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalysisOutput {
    /// Analyzed records in input order.
    pub opportunities: Vec<AnalyzedOpportunity>,
    /// Analysis metrics.
    pub metrics: AnalysisMetrics,
}

/// Analysis agent errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// LM call failed.
    #[error("analysis model call failed: {0}")]
    Model(String),
    /// LM response was missing required content.
    #[error("analysis validation failed, missing scoring: {0}")]
    MissingScoring(String),
}

impl From<AnalysisError> for AttemptFailure {
    fn from(err: AnalysisError) -> Self {
        Self::message(err.to_string())
    }
}

/// Enriches new opportunities with LM scoring and categorization.
pub trait AnalysisAgent: Send + Sync {
    /// Analyzes a batch of new records, preserving input order.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError`] when enrichment fails.
    fn enhance(
        &self,
        new_opportunities: &[ExtractedOpportunity],
        source: &Source,
    ) -> Result<AnalysisOutput, AnalysisError>;
}

// ============================================================================
// SECTION: Filter
// ============================================================================

/// Metrics reported by one filter pass.
///
/// # Invariants
/// - `included + excluded` equals the input count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FilterMetrics {
    /// Filter wall time in milliseconds.
    pub execution_time_ms: u64,
    /// Records passed through.
    pub included: u64,
    /// Records dropped.
    pub excluded: u64,
}

/// Result of one filter pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FilterOutput {
    /// Records passed through, in input order.
    pub included_opportunities: Vec<AnalyzedOpportunity>,
    /// Filter metrics.
    pub metrics: FilterMetrics,
}

/// Filter errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Filter input was malformed.
    #[error("filter validation failed: {0}")]
    Invalid(String),
}

impl From<FilterError> for AttemptFailure {
    fn from(err: FilterError) -> Self {
        Self::message(err.to_string())
    }
}

/// Deterministic, pure filter over analyzed opportunities.
pub trait OpportunityFilter: Send + Sync {
    /// Filters analyzed records; identical inputs yield identical outputs.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] when the input is malformed.
    fn filter(&self, enhanced: Vec<AnalyzedOpportunity>) -> Result<FilterOutput, FilterError>;
}

// ============================================================================
// SECTION: Storage Agent
// ============================================================================

/// Metrics reported by one storage pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StorageMetrics {
    /// Rows inserted.
    pub new_opportunities: u64,
    /// Rows updated in place.
    pub updated: u64,
    /// Rows that failed to persist.
    pub failed: u64,
    /// Storage wall time in milliseconds.
    pub execution_time_ms: u64,
}

/// Result of one storage pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StorageOutcome {
    /// Canonical identifiers of rows written, in input order.
    pub stored_ids: Vec<OpportunityId>,
    /// External identifiers of rows written, in input order.
    pub stored_api_ids: Vec<String>,
    /// Storage metrics.
    pub metrics: StorageMetrics,
}

/// Storage agent errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum StorageAgentError {
    /// Record failed canonical validation.
    #[error("storage validation failed: {0}")]
    Invalid(String),
    /// Datastore write failed.
    #[error("storage database write failed: {0}")]
    Store(String),
}

impl From<StorageAgentError> for AttemptFailure {
    fn from(err: StorageAgentError) -> Self {
        Self::message(err.to_string())
    }
}

/// Persists included opportunities into the canonical store.
pub trait StorageAgent: Send + Sync {
    /// Stores a batch of included records. Re-storing an already-stored
    /// external identifier within a short window is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageAgentError`] when persistence fails.
    fn store(
        &self,
        included: &[AnalyzedOpportunity],
        source: &Source,
        force_full_reprocessing: bool,
    ) -> Result<StorageOutcome, StorageAgentError>;
}

// ============================================================================
// SECTION: Language Model Client
// ============================================================================

/// One LM completion request.
///
/// # Invariants
/// - `max_tokens` bounds the completion size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmRequest {
    /// System prompt.
    pub system: String,
    /// User prompt.
    pub prompt: String,
    /// Completion token cap.
    pub max_tokens: u32,
}

/// One LM completion response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmResponse {
    /// Completion text.
    pub content: String,
    /// Tokens consumed by the request and completion.
    pub tokens_used: u64,
}

/// LM client errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum LmError {
    /// Transport-level failure.
    #[error("language model api call failed: {0}")]
    Transport(String),
    /// Model returned unusable output.
    #[error("language model returned missing content: {0}")]
    MissingContent(String),
}

/// Minimal LM client contract consumed by agents.
pub trait LanguageModel: Send + Sync {
    /// Runs one completion.
    ///
    /// # Errors
    ///
    /// Returns [`LmError`] when the completion fails.
    fn complete(&self, request: &LmRequest) -> Result<LmResponse, LmError>;
}

// ============================================================================
// SECTION: Datastore
// ============================================================================

/// Datastore errors shared by every store surface.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// Store I/O failure.
    #[error("datastore io error: {0}")]
    Io(String),
    /// Stored data is corrupt or fails integrity checks.
    #[error("datastore corruption: {0}")]
    Corrupt(String),
    /// Write conflicted with a concurrent mutation.
    #[error("datastore conflict: {0}")]
    Conflict(String),
    /// Row violates a uniqueness constraint.
    #[error("datastore duplicate constraint: {0}")]
    Duplicate(String),
    /// Data is invalid for the requested operation.
    #[error("datastore invalid data: {0}")]
    Invalid(String),
    /// Store is unreachable.
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

impl From<DatastoreError> for AttemptFailure {
    fn from(err: DatastoreError) -> Self {
        Self::message(err.to_string())
    }
}

/// Result of a conditional opportunity update.
///
/// # Invariants
/// - Variants are exhaustive for the optimistic-concurrency protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateApplied {
    /// Update was applied.
    Applied,
    /// Row revision changed since it was read.
    VersionConflict,
    /// Row no longer exists.
    Missing,
}

/// Result of an optimistic run write.
///
/// # Invariants
/// - Variants are exhaustive for the optimistic-concurrency protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunWrite {
    /// Write was applied.
    Applied,
    /// Run revision changed since it was read.
    Conflict,
}

/// Handle for a held advisory lock.
///
/// # Invariants
/// - `token` is unique per acquisition and required for release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// 31-bit advisory key.
    pub key: i64,
    /// Acquisition token.
    pub token: String,
}

/// Store surface for source rows and configuration bundles.
pub trait SourceStore: Send + Sync {
    /// Loads a source by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn get_source(&self, source_id: &SourceId) -> Result<Option<Source>, DatastoreError>;

    /// Loads the configuration bundle for a source.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn get_configuration(
        &self,
        source_id: &SourceId,
    ) -> Result<Option<SourceConfiguration>, DatastoreError>;

    /// Lists all sources.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the listing fails.
    fn list_sources(&self) -> Result<Vec<Source>, DatastoreError>;

    /// Inserts a source with its configuration bundle.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Duplicate`] when the identifier exists.
    fn insert_source(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
    ) -> Result<(), DatastoreError>;

    /// Replaces a source row and configuration bundle.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails.
    fn update_source(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
    ) -> Result<(), DatastoreError>;

    /// Deletes a source and its configuration bundle.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the delete fails.
    fn delete_source(&self, source_id: &SourceId) -> Result<(), DatastoreError>;

    /// Stamps `last_checked` on the source row.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails.
    fn stamp_last_checked(
        &self,
        source_id: &SourceId,
        checked_at: Timestamp,
    ) -> Result<(), DatastoreError>;

    /// Sets the per-source force-full-reprocessing flag.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails.
    fn set_force_full_reprocessing(
        &self,
        source_id: &SourceId,
        enabled: bool,
    ) -> Result<(), DatastoreError>;

    /// Returns the active source most overdue for a check, honoring each
    /// source's cadence as a minimum re-check interval.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn next_due_source(&self, now: Timestamp) -> Result<Option<Source>, DatastoreError>;
}

/// Store surface for canonical opportunities.
pub trait OpportunityStore: Send + Sync {
    /// Batched lookup by external identifier within one source.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn find_by_api_ids(
        &self,
        source_id: &SourceId,
        api_ids: &[String],
    ) -> Result<Vec<Opportunity>, DatastoreError>;

    /// Batched lookup by normalized title within one source.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn find_by_normalized_titles(
        &self,
        source_id: &SourceId,
        normalized_titles: &[String],
    ) -> Result<Vec<Opportunity>, DatastoreError>;

    /// Loads one opportunity by canonical identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn get_opportunity(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<Opportunity>, DatastoreError>;

    /// Inserts a canonical row.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Duplicate`] when
    /// `(source_id, api_opportunity_id)` already exists.
    fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<(), DatastoreError>;

    /// Replaces a canonical row guarded by its revision.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails for reasons other
    /// than a revision conflict.
    fn update_opportunity(
        &self,
        opportunity: &Opportunity,
        expected_revision: u64,
    ) -> Result<UpdateApplied, DatastoreError>;

    /// Applies a field-subset patch guarded by the row revision.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails for reasons other
    /// than a revision conflict.
    fn apply_field_patches(
        &self,
        opportunity_id: &OpportunityId,
        patches: &[FieldPatch],
        expected_revision: u64,
        updated_at: Timestamp,
    ) -> Result<UpdateApplied, DatastoreError>;

    /// Counts canonical rows for one source.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the count fails.
    fn count_for_source(&self, source_id: &SourceId) -> Result<u64, DatastoreError>;
}

/// Store surface for run bookkeeping.
pub trait RunStore: Send + Sync {
    /// Inserts a run row.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Duplicate`] when the run exists.
    fn insert_run(&self, run: &Run) -> Result<(), DatastoreError>;

    /// Loads a run by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn load_run(&self, run_id: &RunId) -> Result<Option<Run>, DatastoreError>;

    /// Writes a run guarded by its revision.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails for reasons other
    /// than a revision conflict.
    fn update_run(&self, run: &Run, expected_revision: u64) -> Result<RunWrite, DatastoreError>;

    /// Upserts a stage row keyed by `(run_id, stage, job_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails.
    fn upsert_stage(&self, stage: &StageRecord) -> Result<(), DatastoreError>;

    /// Loads all stage rows for a run in stage order.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn load_stages(&self, run_id: &RunId) -> Result<Vec<StageRecord>, DatastoreError>;

    /// Inserts a per-opportunity path record.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails.
    fn insert_path(&self, path: &OpportunityPath) -> Result<(), DatastoreError>;

    /// Loads all path records for a run.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn load_paths(&self, run_id: &RunId) -> Result<Vec<OpportunityPath>, DatastoreError>;

    /// Inserts the duplicate-detection session for a run.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Duplicate`] when a session already exists
    /// for the run.
    fn insert_detection_session(
        &self,
        session: &DuplicateDetectionSession,
    ) -> Result<(), DatastoreError>;

    /// Loads the duplicate-detection session for a run.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn load_detection_session(
        &self,
        run_id: &RunId,
    ) -> Result<Option<DuplicateDetectionSession>, DatastoreError>;

    /// Lists non-terminal runs started at or before the cutoff.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the listing fails.
    fn list_unfinished_runs(&self, cutoff: Timestamp) -> Result<Vec<Run>, DatastoreError>;
}

/// Cooperative advisory-lock primitive keyed by 31-bit integers.
pub trait AdvisoryLock: Send + Sync {
    /// Attempts to acquire the lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lock subsystem is unreachable.
    fn try_acquire(&self, key: i64) -> Result<Option<LockHandle>, DatastoreError>;

    /// Releases a held lock.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the release fails.
    fn release(&self, handle: &LockHandle) -> Result<(), DatastoreError>;
}

/// Store surface for process-wide configuration flags.
pub trait SystemConfigStore: Send + Sync {
    /// Reads a boolean flag.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn get_flag(&self, key: &str) -> Result<Option<bool>, DatastoreError>;

    /// Writes a boolean flag.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails.
    fn set_flag(&self, key: &str, value: bool) -> Result<(), DatastoreError>;
}

/// Store surface for raw external response references.
pub trait RawResponseStore: Send + Sync {
    /// Stores a raw response body and returns its reference identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the write fails.
    fn store_raw_response(
        &self,
        source_id: &SourceId,
        body: &Value,
        captured_at: Timestamp,
    ) -> Result<String, DatastoreError>;

    /// Loads a raw response by reference identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the lookup fails.
    fn load_raw_response(&self, raw_response_id: &str)
    -> Result<Option<RawResponse>, DatastoreError>;
}

/// Complete datastore contract consumed by the runtime.
pub trait Datastore:
    SourceStore
    + OpportunityStore
    + RunStore
    + AdvisoryLock
    + SystemConfigStore
    + RawResponseStore
{
    /// Reports store readiness for liveness/readiness probes.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the store is unavailable.
    fn readiness(&self) -> Result<(), DatastoreError> {
        Ok(())
    }
}
