// fundline-core/src/runtime/run_manager.rs
// ============================================================================
// Module: Fundline Run Manager
// Description: Run lifecycle, stage upserts, paths, sessions, and metrics.
// Purpose: Serialize all run bookkeeping behind a single writer per run.
// Dependencies: crate::core, crate::interfaces, crate::runtime::metrics
// ============================================================================

//! ## Overview
//! The run manager owns every write against a run record: stage transitions
//! with timing stamps, retry bookkeeping, per-opportunity paths, the
//! duplicate-detection session, optimization totals, and the single terminal
//! transition. Writes are serialized by an in-process mutex and guarded by
//! an optimistic revision check in the store; terminal transitions re-read
//! the stored status and abort when another writer got there first.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::core::ClassifiedError;
use crate::core::DerivedMetrics;
use crate::core::DuplicateDetectionSession;
use crate::core::ErrorCategory;
use crate::core::JobId;
use crate::core::OpportunityPath;
use crate::core::RetryAttempt;
use crate::core::Run;
use crate::core::RunId;
use crate::core::RunStatus;
use crate::core::RunTotals;
use crate::core::SourceId;
use crate::core::StageName;
use crate::core::StageRecord;
use crate::core::StageStatus;
use crate::core::Timestamp;
use crate::core::time::Clock;
use crate::core::timeout_error;
use crate::interfaces::DatastoreError;
use crate::interfaces::RunStore;
use crate::interfaces::RunWrite;
use crate::runtime::metrics;
use crate::runtime::metrics::SlaInputs;
use crate::runtime::metrics::SlaTargets;
use crate::runtime::retry::RetrySink;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Failure reason recorded by orphan cleanup.
pub const ORPHAN_CLEANUP_REASON: &str = "orphaned_run_cleanup";
/// Default per-run timeout in milliseconds.
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 1_800_000;
/// Default estimated cost per LM token in USD.
pub const DEFAULT_COST_PER_TOKEN_USD: f64 = 0.000_01;

/// Run manager configuration.
///
/// # Invariants
/// - `run_timeout_ms >= 1`; `cost_per_token_usd >= 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunManagerConfig {
    /// Pipeline version tag stamped on runs.
    pub pipeline_version: String,
    /// Per-run timeout in milliseconds.
    pub run_timeout_ms: u64,
    /// Estimated cost per LM token in USD.
    pub cost_per_token_usd: f64,
    /// SLA targets for derived metrics.
    pub sla_targets: SlaTargets,
}

impl Default for RunManagerConfig {
    fn default() -> Self {
        Self {
            pipeline_version: "v2".to_string(),
            run_timeout_ms: DEFAULT_RUN_TIMEOUT_MS,
            cost_per_token_usd: DEFAULT_COST_PER_TOKEN_USD,
            sla_targets: SlaTargets::default(),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Run manager errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum RunManagerError {
    /// Underlying store failure.
    #[error("run storage error: {0}")]
    Store(#[from] DatastoreError),
    /// No run has been started on this manager.
    #[error("run storage error: no active run")]
    NoActiveRun,
    /// The run already took its terminal transition.
    #[error("run already terminal: {0}")]
    AlreadyTerminal(String),
    /// A stage transition violated the status machine.
    #[error("invalid stage transition: {0}")]
    InvalidTransition(String),
    /// Concurrent writer detected via revision conflict.
    #[error("run storage conflict: {0}")]
    Conflict(String),
    /// Internal mutex poisoned.
    #[error("run storage error: run manager mutex poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Stage Updates
// ============================================================================

/// One stage upsert request.
///
/// # Invariants
/// - Counters are absolute values for the stage, not deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct StageUpdate {
    /// Stage being updated.
    pub stage: StageName,
    /// New status.
    pub status: StageStatus,
    /// Stage results blob.
    pub stage_results: Option<Value>,
    /// Performance metrics blob.
    pub performance_metrics: Option<Value>,
    /// LM tokens consumed by the stage.
    pub tokens_used: u64,
    /// Outbound API calls made by the stage.
    pub api_calls_made: u64,
    /// Records entering the stage.
    pub input_count: u64,
    /// Records leaving the stage.
    pub output_count: u64,
    /// Optional job identifier for parallel sub-executions.
    pub job_id: Option<JobId>,
    /// Wall time override; computed from stamps when absent.
    pub execution_time_ms: Option<u64>,
}

impl StageUpdate {
    /// Creates a minimal update carrying only stage, status, and counts.
    #[must_use]
    pub const fn counts(
        stage: StageName,
        status: StageStatus,
        input_count: u64,
        output_count: u64,
    ) -> Self {
        Self {
            stage,
            status,
            stage_results: None,
            performance_metrics: None,
            tokens_used: 0,
            api_calls_made: 0,
            input_count,
            output_count,
            job_id: None,
            execution_time_ms: None,
        }
    }
}

/// Accumulated totals pushed by the coordinator before completion.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OptimizationTotals {
    /// Opportunities stored or directly updated.
    pub total_opportunities: u64,
    /// Records that bypassed the LM (updates plus skips).
    pub bypassed_llm: u64,
    /// LM tokens consumed.
    pub total_tokens: u64,
    /// Outbound API calls made.
    pub total_api_calls: u64,
    /// Estimated LM cost in USD.
    pub estimated_cost_usd: f64,
    /// Opportunities that reached a successful terminal outcome.
    pub successful_opportunities: u64,
}

// ============================================================================
// SECTION: Active Run State
// ============================================================================

/// Mutable state for the run owned by this manager.
#[derive(Debug)]
struct ActiveRun {
    /// Run record mirrored from the store.
    run: Run,
    /// Timeout deadline; `None` once disarmed.
    deadline: Option<Timestamp>,
    /// Stage rows keyed by stage and job.
    stages: BTreeMap<(StageName, Option<JobId>), StageRecord>,
    /// Retry attempts buffered per stage until the next stage upsert.
    retry_buffer: BTreeMap<StageName, Vec<RetryAttempt>>,
    /// Stage-failure log entries.
    failure_log: Vec<Value>,
    /// Recovery log entries.
    recovery_log: Vec<Value>,
    /// Count-handoff warnings collected during the run.
    warnings: Vec<String>,
}

// ============================================================================
// SECTION: Run Manager
// ============================================================================

/// Single-writer run bookkeeping manager.
pub struct RunManager {
    /// Run store backing all writes.
    store: Arc<dyn RunStore>,
    /// Clock for transition stamps.
    clock: Arc<dyn Clock>,
    /// Manager configuration.
    config: RunManagerConfig,
    /// Active run state behind the single-writer mutex.
    inner: Mutex<Option<ActiveRun>>,
}

impl RunManager {
    /// Creates a run manager over the given store and clock.
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, clock: Arc<dyn Clock>, config: RunManagerConfig) -> Self {
        Self {
            store,
            clock,
            config,
            inner: Mutex::new(None),
        }
    }

    /// Starts a run, or adopts an existing one when `injected` names a run
    /// already present in the store.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError`] when the insert or adoption fails.
    pub fn start_run(
        &self,
        source_id: &SourceId,
        configuration: Value,
        injected: Option<RunId>,
    ) -> Result<RunId, RunManagerError> {
        let now = self.clock.now();
        let mut guard = self.inner.lock().map_err(|_| RunManagerError::Poisoned)?;
        if let Some(run_id) = &injected
            && let Some(existing) = self.store.load_run(run_id)?
        {
            let stages = self
                .store
                .load_stages(run_id)?
                .into_iter()
                .map(|stage| ((stage.stage, stage.job_id.clone()), stage))
                .collect();
            let deadline = Some(
                existing
                    .started_at
                    .saturating_add_millis(to_i64(self.config.run_timeout_ms)),
            );
            *guard = Some(ActiveRun {
                run: existing,
                deadline,
                stages,
                retry_buffer: BTreeMap::new(),
                failure_log: Vec::new(),
                recovery_log: Vec::new(),
                warnings: Vec::new(),
            });
            return Ok(run_id.clone());
        }
        let run_id = injected.unwrap_or_else(RunId::generate);
        let run = Run {
            run_id: run_id.clone(),
            source_id: source_id.clone(),
            pipeline_version: self.config.pipeline_version.clone(),
            status: RunStatus::Started,
            started_at: now,
            completed_at: None,
            total_execution_time_ms: None,
            configuration,
            totals: RunTotals::default(),
            derived: DerivedMetrics::default(),
            failure_breakdown: BTreeMap::new(),
            final_results: None,
            error_details: None,
            concurrent_processing_detected: false,
            force_full_reprocessing_used: false,
            revision: 1,
        };
        self.store.insert_run(&run)?;
        let deadline = Some(now.saturating_add_millis(to_i64(self.config.run_timeout_ms)));
        *guard = Some(ActiveRun {
            run,
            deadline,
            stages: BTreeMap::new(),
            retry_buffer: BTreeMap::new(),
            failure_log: Vec::new(),
            recovery_log: Vec::new(),
            warnings: Vec::new(),
        });
        Ok(run_id)
    }

    /// Returns the active run identifier.
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        self.inner
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|active| active.run.run_id.clone()))
    }

    /// Returns a snapshot of the active run record.
    #[must_use]
    pub fn snapshot_run(&self) -> Option<Run> {
        self.inner.lock().ok().and_then(|guard| guard.as_ref().map(|active| active.run.clone()))
    }

    /// Marks the run as contended on the source lock.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError`] when persistence fails.
    pub fn set_concurrent_processing_detected(&self) -> Result<(), RunManagerError> {
        self.mutate_run(|run| {
            run.concurrent_processing_detected = true;
        })
    }

    /// Records that the force-full-reprocessing override was in effect.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError`] when persistence fails.
    pub fn set_force_used(&self) -> Result<(), RunManagerError> {
        self.mutate_run(|run| {
            run.force_full_reprocessing_used = true;
        })
    }

    /// Collects a count-handoff warning for the final results blob.
    pub fn record_count_warning(&self, warning: impl Into<String>) {
        if let Ok(mut guard) = self.inner.lock()
            && let Some(active) = guard.as_mut()
        {
            active.warnings.push(warning.into());
        }
    }

    /// Upserts a stage row, stamping transitions.
    ///
    /// `started_at` is stamped on the first entry to processing and
    /// `completed_at` on the terminal status; `execution_time_ms` is derived
    /// from the stamps unless supplied. Estimated cost is tokens times the
    /// configured per-token rate.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError::InvalidTransition`] on status-machine
    /// violations and [`RunManagerError::Store`] when persistence fails.
    pub fn update_stage(&self, update: StageUpdate) -> Result<(), RunManagerError> {
        let now = self.clock.now();
        let mut guard = self.inner.lock().map_err(|_| RunManagerError::Poisoned)?;
        let active = guard.as_mut().ok_or(RunManagerError::NoActiveRun)?;
        let key = (update.stage, update.job_id.clone());
        let drained = active.retry_buffer.remove(&update.stage).unwrap_or_default();
        let record = active.stages.entry(key).or_insert_with(|| StageRecord {
            run_id: active.run.run_id.clone(),
            stage: update.stage,
            stage_order: update.stage.stage_order(),
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            input_count: 0,
            output_count: 0,
            tokens_used: 0,
            api_calls_made: 0,
            estimated_cost_usd: 0.0,
            stage_results: None,
            performance_metrics: None,
            retry_history: Vec::new(),
            job_id: update.job_id.clone(),
        });
        if record.status.is_terminal() && record.status != update.status {
            return Err(RunManagerError::InvalidTransition(format!(
                "stage {} already terminal",
                update.stage
            )));
        }
        if update.status == StageStatus::Processing && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if update.status.is_terminal() {
            if record.started_at.is_none() {
                record.started_at = Some(now);
            }
            record.completed_at = Some(now);
            let computed = record.started_at.map(|started| now.millis_since(started));
            record.execution_time_ms = update.execution_time_ms.or(computed);
        }
        record.status = update.status;
        record.input_count = update.input_count;
        record.output_count = update.output_count;
        record.tokens_used = update.tokens_used;
        record.api_calls_made = update.api_calls_made;
        record.estimated_cost_usd =
            token_cost(update.tokens_used, self.config.cost_per_token_usd);
        if update.stage_results.is_some() {
            record.stage_results = update.stage_results;
        }
        if update.performance_metrics.is_some() {
            record.performance_metrics = update.performance_metrics;
        }
        record.retry_history.extend(drained);
        let persisted = record.clone();
        self.store.upsert_stage(&persisted)?;
        if active.run.status == RunStatus::Started {
            active.run.status = RunStatus::Processing;
            Self::persist_run(&self.store, active)?;
        }
        Ok(())
    }

    /// Records one opportunity path.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError::InvalidTransition`] when the outcome is
    /// not allowed for the path type, or [`RunManagerError::Store`] when
    /// persistence fails.
    pub fn record_opportunity_path(&self, path: &OpportunityPath) -> Result<(), RunManagerError> {
        if !path.final_outcome.allowed_for(path.path_type) {
            return Err(RunManagerError::InvalidTransition(format!(
                "outcome not allowed for path type on {}",
                path.api_opportunity_id
            )));
        }
        self.store.insert_path(path)?;
        Ok(())
    }

    /// Records the duplicate-detection session for the run.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError::InvalidTransition`] when the session
    /// totals do not reconcile, or [`RunManagerError::Store`] when
    /// persistence fails.
    pub fn record_detection_session(
        &self,
        session: &DuplicateDetectionSession,
    ) -> Result<(), RunManagerError> {
        let reconciled = session.new_opportunities
            + session.duplicates_to_update
            + session.duplicates_to_skip
            + session.validation_failures;
        if session.total_opportunities_checked != reconciled {
            return Err(RunManagerError::InvalidTransition(format!(
                "detection session totals do not reconcile: {} != {reconciled}",
                session.total_opportunities_checked
            )));
        }
        self.store.insert_detection_session(session)?;
        Ok(())
    }

    /// Applies accumulated totals and recomputes derived metrics.
    ///
    /// Totals are merged monotonically: a later update can only grow them.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError`] when persistence fails.
    pub fn update_optimization_metrics(
        &self,
        totals: &OptimizationTotals,
    ) -> Result<(), RunManagerError> {
        let now = self.clock.now();
        let targets = self.config.sla_targets;
        self.mutate_run(|run| {
            run.totals.opportunities_processed =
                run.totals.opportunities_processed.max(totals.total_opportunities);
            run.totals.opportunities_bypassed_llm =
                run.totals.opportunities_bypassed_llm.max(totals.bypassed_llm);
            run.totals.tokens_used = run.totals.tokens_used.max(totals.total_tokens);
            run.totals.api_calls = run.totals.api_calls.max(totals.total_api_calls);
            run.totals.estimated_cost_usd =
                run.totals.estimated_cost_usd.max(totals.estimated_cost_usd);
            let elapsed = run
                .total_execution_time_ms
                .unwrap_or_else(|| now.millis_since(run.started_at));
            run.derived = derive_metrics(run, elapsed, &targets);
        })
    }

    /// Completes the run, aggregating derived metrics and final results.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError::AlreadyTerminal`] when another writer took
    /// the terminal transition first, or [`RunManagerError::Store`] when
    /// persistence fails.
    pub fn complete_run(
        &self,
        total_execution_time_ms: u64,
        final_results: Value,
    ) -> Result<(), RunManagerError> {
        let now = self.clock.now();
        let targets = self.config.sla_targets;
        let mut guard = self.inner.lock().map_err(|_| RunManagerError::Poisoned)?;
        let active = guard.as_mut().ok_or(RunManagerError::NoActiveRun)?;
        self.abort_if_terminal(active)?;
        active.run.status = RunStatus::Completed;
        active.run.completed_at = Some(now);
        active.run.total_execution_time_ms = Some(total_execution_time_ms);
        active.run.derived = derive_metrics(&active.run, total_execution_time_ms, &targets);
        active.run.final_results = Some(decorate_final_results(final_results, active));
        active.deadline = None;
        Self::persist_run(&self.store, active)
    }

    /// Fails the run unless it is already terminal.
    ///
    /// A run that already took its terminal transition is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RunManagerError`] when persistence fails.
    pub fn fail_run(
        &self,
        error: &ClassifiedError,
        failed_stage: StageName,
    ) -> Result<(), RunManagerError> {
        let now = self.clock.now();
        let targets = self.config.sla_targets;
        let mut guard = self.inner.lock().map_err(|_| RunManagerError::Poisoned)?;
        let active = guard.as_mut().ok_or(RunManagerError::NoActiveRun)?;
        if self.abort_if_terminal(active).is_err() {
            return Ok(());
        }
        active.run.status = RunStatus::Failed;
        active.run.completed_at = Some(now);
        let elapsed = now.millis_since(active.run.started_at);
        active.run.total_execution_time_ms = Some(elapsed);
        bump_failure(&mut active.run, error.category);
        active.run.error_details = Some(json!({
            "category": error.category,
            "error": error.original_message,
            "user_message": error.user_message,
            "failed_stage": failed_stage.as_str(),
            "failure_log": active.failure_log,
        }));
        active.run.derived = derive_metrics(&active.run, elapsed, &targets);
        active.deadline = None;
        Self::persist_run(&self.store, active)
    }

    /// Fails the run when the timeout deadline has passed.
    ///
    /// The current stage is marked failed and the run takes its terminal
    /// transition with a TIMEOUT classification.
    ///
    /// # Errors
    ///
    /// Returns the timeout [`ClassifiedError`] when the guard fired.
    pub fn check_timeout(&self, current_stage: StageName) -> Result<(), ClassifiedError> {
        let now = self.clock.now();
        let expired = {
            let Ok(guard) = self.inner.lock() else {
                return Ok(());
            };
            guard.as_ref().is_some_and(|active| {
                !active.run.status.is_terminal()
                    && active.deadline.is_some_and(|deadline| now > deadline)
            })
        };
        if !expired {
            return Ok(());
        }
        let classified = timeout_error(current_stage, "run exceeded its time budget");
        let existing = self.snapshot_stage(current_stage);
        let (input_count, output_count) =
            existing.map_or((0, 0), |stage| (stage.input_count, stage.output_count));
        let _ = self.update_stage(StageUpdate {
            stage_results: Some(json!({ "timeout": true })),
            ..StageUpdate::counts(current_stage, StageStatus::Failed, input_count, output_count)
        });
        let _ = self.fail_run(&classified, current_stage);
        Err(classified)
    }

    /// Re-arms the timeout guard with a fresh budget from now.
    pub fn reset_timeout(&self, timeout_ms: u64) {
        let now = self.clock.now();
        if let Ok(mut guard) = self.inner.lock()
            && let Some(active) = guard.as_mut()
        {
            active.deadline = Some(now.saturating_add_millis(to_i64(timeout_ms)));
        }
    }

    /// Returns the active timeout deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<Timestamp> {
        self.inner.lock().ok().and_then(|guard| guard.as_ref().and_then(|active| active.deadline))
    }

    /// Returns a snapshot of one stage row.
    #[must_use]
    pub fn snapshot_stage(&self, stage: StageName) -> Option<StageRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(|active| active.stages.get(&(stage, None)).cloned()))
    }

    /// Aborts with [`RunManagerError::AlreadyTerminal`] when the stored run
    /// already took a terminal transition.
    fn abort_if_terminal(&self, active: &mut ActiveRun) -> Result<(), RunManagerError> {
        if active.run.status.is_terminal() {
            return Err(RunManagerError::AlreadyTerminal(active.run.run_id.to_string()));
        }
        if let Some(stored) = self.store.load_run(&active.run.run_id).unwrap_or(None) {
            if stored.status.is_terminal() {
                active.run = stored;
                return Err(RunManagerError::AlreadyTerminal(active.run.run_id.to_string()));
            }
            active.run.revision = stored.revision;
        }
        Ok(())
    }

    /// Applies a mutation to the run record and persists it.
    fn mutate_run(&self, mutate: impl FnOnce(&mut Run)) -> Result<(), RunManagerError> {
        let mut guard = self.inner.lock().map_err(|_| RunManagerError::Poisoned)?;
        let active = guard.as_mut().ok_or(RunManagerError::NoActiveRun)?;
        mutate(&mut active.run);
        Self::persist_run(&self.store, active)
    }

    /// Persists the run with an optimistic revision check.
    fn persist_run(store: &Arc<dyn RunStore>, active: &mut ActiveRun) -> Result<(), RunManagerError> {
        let expected = active.run.revision;
        active.run.revision = expected + 1;
        match store.update_run(&active.run, expected)? {
            RunWrite::Applied => Ok(()),
            RunWrite::Conflict => {
                active.run.revision = expected;
                Err(RunManagerError::Conflict(active.run.run_id.to_string()))
            }
        }
    }
}

impl RetrySink for RunManager {
    fn on_retry(&self, stage: StageName, attempt: u32, delay_ms: u64, reason: &str) {
        let now = self.clock.now();
        if let Ok(mut guard) = self.inner.lock()
            && let Some(active) = guard.as_mut()
        {
            active.retry_buffer.entry(stage).or_default().push(RetryAttempt {
                attempt,
                delay_ms,
                reason: reason.to_string(),
                recorded_at: now,
            });
        }
    }

    fn on_exhausted(
        &self,
        stage: StageName,
        attempt: u32,
        classified: &ClassifiedError,
        elapsed_ms: u64,
    ) {
        if let Ok(mut guard) = self.inner.lock()
            && let Some(active) = guard.as_mut()
        {
            // The terminal transition owns the breakdown counters; the log
            // keeps per-attempt detail.
            active.failure_log.push(json!({
                "stage": stage.as_str(),
                "attempt": attempt,
                "category": classified.category,
                "error": classified.original_message,
                "elapsed_ms": elapsed_ms,
            }));
        }
    }

    fn on_recovery(&self, stage: StageName, attempts: u32) {
        if let Ok(mut guard) = self.inner.lock()
            && let Some(active) = guard.as_mut()
        {
            active.recovery_log.push(json!({
                "stage": stage.as_str(),
                "attempts": attempts,
            }));
        }
    }
}

// ============================================================================
// SECTION: Orphan Cleanup
// ============================================================================

/// Marks runs stuck in a non-terminal status past the cutoff as failed.
///
/// Returns the number of runs cleaned.
///
/// # Errors
///
/// Returns [`DatastoreError`] when the sweep cannot read or write runs.
pub fn cleanup_orphaned_runs(
    store: &dyn RunStore,
    now: Timestamp,
    timeout_ms: u64,
) -> Result<u64, DatastoreError> {
    let cutoff = Timestamp::from_unix_millis(
        now.as_unix_millis().saturating_sub(to_i64(timeout_ms)),
    );
    let mut cleaned = 0_u64;
    for mut run in store.list_unfinished_runs(cutoff)? {
        run.status = RunStatus::Failed;
        run.completed_at = Some(now);
        run.total_execution_time_ms = Some(now.millis_since(run.started_at));
        run.error_details = Some(json!({
            "category": ErrorCategory::TimeoutError,
            "error": ORPHAN_CLEANUP_REASON,
        }));
        bump_failure(&mut run, ErrorCategory::TimeoutError);
        let expected = run.revision;
        run.revision = expected + 1;
        if matches!(store.update_run(&run, expected)?, RunWrite::Applied) {
            cleaned += 1;
        }
    }
    Ok(cleaned)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Increments the failure-breakdown counter for a category.
fn bump_failure(run: &mut Run, category: ErrorCategory) {
    *run.failure_breakdown.entry(category.as_str().to_string()).or_insert(0) += 1;
}

/// Recomputes derived metrics from run totals and elapsed time.
fn derive_metrics(run: &Run, elapsed_ms: u64, targets: &SlaTargets) -> DerivedMetrics {
    let totals = &run.totals;
    let failures: u64 = run.failure_breakdown.values().sum();
    let opportunities_per_minute =
        metrics::opportunities_per_minute(totals.opportunities_processed, elapsed_ms);
    let success_rate_percentage =
        metrics::success_rate_percentage(failures, totals.opportunities_processed);
    let cost_per_opportunity_usd = metrics::cost_per_opportunity_usd(
        totals.estimated_cost_usd,
        totals.opportunities_processed,
    );
    let inputs = SlaInputs {
        opportunities_per_minute,
        success_rate_percentage,
        cost_per_opportunity_usd,
        total_execution_time_ms: elapsed_ms,
    };
    let sla_compliance_percentage = metrics::sla_compliance_percentage(&inputs, targets);
    DerivedMetrics {
        opportunities_per_minute,
        tokens_per_opportunity: metrics::tokens_per_opportunity(
            totals.tokens_used,
            totals.opportunities_processed,
        ),
        cost_per_opportunity_usd,
        success_rate_percentage,
        sla_compliance_percentage,
        sla_grade: metrics::sla_grade(sla_compliance_percentage),
    }
}

/// Merges run warnings and recovery log into the final results blob.
fn decorate_final_results(final_results: Value, active: &ActiveRun) -> Value {
    let mut merged = match final_results {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("results".to_string(), other);
            map
        }
    };
    if !active.warnings.is_empty() {
        merged.insert("count_warnings".to_string(), json!(active.warnings));
    }
    if !active.recovery_log.is_empty() {
        merged.insert("recoveries".to_string(), json!(active.recovery_log));
    }
    Value::Object(merged)
}

/// Estimated USD cost for a token count.
#[allow(clippy::cast_precision_loss, reason = "Token counts stay far below 2^52.")]
fn token_cost(tokens: u64, cost_per_token_usd: f64) -> f64 {
    tokens as f64 * cost_per_token_usd
}

/// Converts a millisecond budget to a signed offset.
fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
