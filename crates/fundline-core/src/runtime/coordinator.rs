// fundline-core/src/runtime/coordinator.rs
// ============================================================================
// Module: Fundline Stage Coordinator
// Description: The canonical seven-stage pipeline execution path.
// Purpose: Sequence analysis, extraction, duplicate detection, and the
//          NEW / UPDATE / SKIP branches with full run bookkeeping.
// Dependencies: crate::core, crate::interfaces, crate::runtime
// ============================================================================

//! ## Overview
//! The coordinator is the single canonical execution path for a source run.
//! Stages always execute in the fixed order; branches are chosen only by the
//! duplicate detector's output. A stage that receives no input is marked
//! skipped, never completed. Every error crossing the process boundary is
//! returned as a structured result, never re-thrown.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

use crate::core::AttemptFailure;
use crate::core::ClassifiedError;
use crate::core::DerivedMetrics;
use crate::core::ErrorCategory;
use crate::core::ExtractedOpportunity;
use crate::core::FinalOutcome;
use crate::core::OpportunityPath;
use crate::core::PathType;
use crate::core::RunId;
use crate::core::Source;
use crate::core::SourceConfiguration;
use crate::core::SourceId;
use crate::core::StageName;
use crate::core::StageStatus;
use crate::core::Timestamp;
use crate::core::classify;
use crate::core::time::Clock;
use crate::interfaces::AnalysisAgent;
use crate::interfaces::AnalysisOutput;
use crate::interfaces::AnalyzedOpportunity;
use crate::interfaces::DataExtractor;
use crate::interfaces::Datastore;
use crate::interfaces::ExtractionOutput;
use crate::interfaces::FilterOutput;
use crate::interfaces::OpportunityFilter;
use crate::interfaces::SourceAnalysis;
use crate::interfaces::SourceAnalyzer;
use crate::interfaces::StorageAgent;
use crate::interfaces::StorageOutcome;
use crate::runtime::detector::DetectionOutput;
use crate::runtime::detector::DetectorConfig;
use crate::runtime::detector::EarlyDuplicateDetector;
use crate::runtime::detector::REASON_FORCE_FULL_REPROCESSING;
use crate::runtime::direct_update::DirectUpdateHandler;
use crate::runtime::direct_update::DirectUpdateOutcome;
use crate::runtime::force;
use crate::runtime::lock::release_source_lock;
use crate::runtime::lock::try_acquire_source_lock;
use crate::runtime::metrics::SlaTargets;
use crate::runtime::retry;
use crate::runtime::retry::BreakerAdmission;
use crate::runtime::retry::CircuitBreaker;
use crate::runtime::retry::RetryPolicy;
use crate::runtime::retry::Waiter;
use crate::runtime::retry::retry_stage;
use crate::runtime::run_manager::OptimizationTotals;
use crate::runtime::run_manager::RunManager;
use crate::runtime::run_manager::RunManagerConfig;
use crate::runtime::run_manager::StageUpdate;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Pipeline-wide configuration for the coordinator.
///
/// # Invariants
/// - `run_timeout_ms >= 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Pipeline version tag stamped on runs and error bodies.
    pub pipeline_version: String,
    /// Per-run timeout in milliseconds.
    pub run_timeout_ms: u64,
    /// Estimated cost per LM token in USD.
    pub cost_per_token_usd: f64,
    /// Duplicate-detector freshness window in milliseconds.
    pub freshness_window_ms: u64,
    /// SLA targets for derived metrics.
    pub sla_targets: SlaTargets,
    /// Whether the per-source circuit breaker guards stages.
    pub circuit_breaker_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_version: "v2".to_string(),
            run_timeout_ms: crate::runtime::run_manager::DEFAULT_RUN_TIMEOUT_MS,
            cost_per_token_usd: crate::runtime::run_manager::DEFAULT_COST_PER_TOKEN_USD,
            freshness_window_ms: crate::runtime::detector::DEFAULT_FRESHNESS_WINDOW_MS,
            sla_targets: SlaTargets::default(),
            circuit_breaker_enabled: true,
        }
    }
}

/// Per-invocation options for the coordinator.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Injected run identifier for idempotent re-entry.
    pub run_id: Option<RunId>,
    /// External cancellation signal, observed at stage boundaries.
    pub cancel: Option<Arc<AtomicBool>>,
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Structured result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Always `completed`.
    pub status: String,
    /// Pipeline version tag.
    pub pipeline: String,
    /// Run identifier.
    pub run_id: RunId,
    /// Source identifier.
    pub source_id: SourceId,
    /// New rows stored.
    pub new_stored: u64,
    /// Rows updated via the direct path.
    pub updated: u64,
    /// Records skipped by the detector.
    pub skipped: u64,
    /// Records excluded by the filter.
    pub filtered_out: u64,
    /// Stored plus updated.
    pub total_opportunities_processed: u64,
    /// Total wall time in milliseconds.
    pub execution_time_ms: u64,
    /// Derived run metrics.
    pub metrics: DerivedMetrics,
    /// Whether the source lock was contended.
    pub concurrent_processing_detected: bool,
}

/// Structured error body returned at the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Always `error`.
    pub status: String,
    /// Pipeline version tag.
    pub pipeline: String,
    /// Failure description.
    pub error: String,
    /// Failure category.
    pub category: ErrorCategory,
    /// Stage that failed, when a run was underway.
    #[serde(rename = "failedStage")]
    pub failed_stage: Option<StageName>,
    /// Run identifier, when a run was started.
    #[serde(rename = "runId")]
    pub run_id: Option<RunId>,
}

/// Process-boundary outcome: structured success or structured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessOutcome {
    /// Run completed.
    Completed(RunReport),
    /// Run failed or could not start.
    Failed(RunFailure),
}

impl ProcessOutcome {
    /// Returns the completed report, when present.
    #[must_use]
    pub const fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Failed(_) => None,
        }
    }

    /// Returns the failure body, when present.
    #[must_use]
    pub const fn failure(&self) -> Option<&RunFailure> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }
}

// ============================================================================
// SECTION: Coordinator
// ============================================================================

/// Stage coordinator executing the canonical pipeline for one source.
pub struct PipelineCoordinator {
    /// Datastore for sources, opportunities, runs, and locks.
    store: Arc<dyn Datastore>,
    /// Source analyzer collaborator.
    analyzer: Arc<dyn SourceAnalyzer>,
    /// Data extractor collaborator.
    extractor: Arc<dyn DataExtractor>,
    /// Analysis agent collaborator.
    analysis: Arc<dyn AnalysisAgent>,
    /// Filter collaborator.
    filter: Arc<dyn OpportunityFilter>,
    /// Storage agent collaborator.
    storage: Arc<dyn StorageAgent>,
    /// Clock for all stamps.
    clock: Arc<dyn Clock>,
    /// Waiter used between retry attempts.
    waiter: Arc<dyn Waiter>,
    /// Per-source circuit breaker.
    breaker: CircuitBreaker,
    /// Pipeline configuration.
    config: PipelineConfig,
}

/// Collaborator bundle for coordinator construction.
pub struct PipelineParts {
    /// Datastore for sources, opportunities, runs, and locks.
    pub store: Arc<dyn Datastore>,
    /// Source analyzer collaborator.
    pub analyzer: Arc<dyn SourceAnalyzer>,
    /// Data extractor collaborator.
    pub extractor: Arc<dyn DataExtractor>,
    /// Analysis agent collaborator.
    pub analysis: Arc<dyn AnalysisAgent>,
    /// Filter collaborator.
    pub filter: Arc<dyn OpportunityFilter>,
    /// Storage agent collaborator.
    pub storage: Arc<dyn StorageAgent>,
    /// Clock for all stamps.
    pub clock: Arc<dyn Clock>,
    /// Waiter used between retry attempts.
    pub waiter: Arc<dyn Waiter>,
}

impl PipelineCoordinator {
    /// Creates a coordinator from its collaborators.
    #[must_use]
    pub fn new(parts: PipelineParts, config: PipelineConfig) -> Self {
        Self {
            store: parts.store,
            analyzer: parts.analyzer,
            extractor: parts.extractor,
            analysis: parts.analysis,
            filter: parts.filter,
            storage: parts.storage,
            clock: parts.clock,
            waiter: parts.waiter,
            breaker: CircuitBreaker::new(),
            config,
        }
    }

    /// Processes one source end to end.
    ///
    /// Never panics or re-throws: every failure surfaces as a structured
    /// [`RunFailure`].
    #[must_use]
    pub fn process_source(&self, source_id: &SourceId, options: &ProcessOptions) -> ProcessOutcome {
        let (source, configuration) = match self.load_source(source_id) {
            Ok(pair) => pair,
            Err(failure) => return ProcessOutcome::Failed(failure),
        };

        let force_requested =
            force::should_force_full_processing(self.store.as_ref(), &source).unwrap_or(false);
        let lock_outcome = try_acquire_source_lock(self.store.as_ref(), source_id);

        let run_manager = RunManager::new(
            self.store.clone(),
            self.clock.clone(),
            RunManagerConfig {
                pipeline_version: self.config.pipeline_version.clone(),
                run_timeout_ms: self.config.run_timeout_ms,
                cost_per_token_usd: self.config.cost_per_token_usd,
                sla_targets: self.config.sla_targets,
            },
        );
        let snapshot = json!({
            "pipeline_version": self.config.pipeline_version,
            "optimization_enabled": true,
            "early_duplicate_detection": true,
            "metrics_collection": true,
            "force_full_reprocessing": force_requested,
        });
        let run_id =
            match run_manager.start_run(source_id, snapshot, options.run_id.clone()) {
                Ok(run_id) => run_id,
                Err(err) => {
                    release_source_lock(self.store.as_ref(), &lock_outcome);
                    return ProcessOutcome::Failed(self.failure_body(
                        classify(
                            StageName::SourceOrchestrator,
                            &AttemptFailure::message(format!("run storage error: {err}")),
                        ),
                        None,
                    ));
                }
            };
        let _ = self.store.stamp_last_checked(source_id, self.clock.now());
        if !lock_outcome.acquired {
            let _ = run_manager.set_concurrent_processing_detected();
        }
        if force_requested {
            let _ = run_manager.set_force_used();
        }

        let result =
            self.run_stages(&run_manager, &source, &configuration, force_requested, options);
        release_source_lock(self.store.as_ref(), &lock_outcome);

        match result {
            Ok(report) => {
                if force_requested {
                    let _ = force::clear_after_success(self.store.as_ref(), source_id);
                }
                ProcessOutcome::Completed(report)
            }
            Err(classified) => {
                let _ = run_manager.fail_run(&classified, classified.stage);
                if force_requested {
                    let _ = force::restore_after_failure(self.store.as_ref(), source_id);
                }
                ProcessOutcome::Failed(self.failure_body(classified, Some(run_id)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Stage sequence
    // ------------------------------------------------------------------

    /// Runs the full stage sequence for one started run.
    fn run_stages(
        &self,
        run_manager: &RunManager,
        source: &Source,
        configuration: &SourceConfiguration,
        force_requested: bool,
        options: &ProcessOptions,
    ) -> Result<RunReport, ClassifiedError> {
        let run_started = self.clock.now();

        let analysis = self.stage_source_orchestrator(run_manager, source, configuration, options)?;
        let extraction =
            self.stage_data_extraction(run_manager, source, configuration, &analysis, options)?;
        let extracted_count = count(&extraction.opportunities);

        if extracted_count == 0 {
            return self.finish_empty_run(run_manager, source, run_started, &analysis, &extraction);
        }

        let detection = self.stage_duplicate_detection(
            run_manager,
            source,
            &extraction,
            force_requested,
            options,
        )?;
        let new_count = count(&detection.new_opportunities);
        let update_count = count(&detection.opportunities_to_update);
        let skip_count = count(&detection.opportunities_to_skip);

        let new_branch = self.branch_new(run_manager, source, &detection, force_requested, options)?;
        let direct = self.branch_update(run_manager, &detection, options)?;

        self.record_paths(run_manager, source, &detection, &new_branch, &direct);

        let stored = new_branch.as_ref().map_or(0, |branch| {
            branch.storage.metrics.new_opportunities + branch.storage.metrics.updated
        });
        let updated = direct.as_ref().map_or(0, |outcome| outcome.metrics.successful);
        let filtered_out =
            new_branch.as_ref().map_or(0, |branch| branch.filter.metrics.excluded);
        let analysis_tokens =
            new_branch.as_ref().map_or(0, |branch| branch.analysis.metrics.total_tokens);
        let analysis_calls =
            new_branch.as_ref().map_or(0, |branch| branch.analysis.metrics.total_api_calls);
        let total_tokens = analysis.token_usage + extraction.metrics.total_tokens + analysis_tokens;
        let total_api_calls =
            analysis.api_calls + extraction.metrics.api_calls + analysis_calls;
        let total_processed = stored + updated;

        let totals = OptimizationTotals {
            total_opportunities: total_processed,
            bypassed_llm: detection.session.llm_processing_bypassed(),
            total_tokens,
            total_api_calls,
            estimated_cost_usd: token_cost(total_tokens, self.config.cost_per_token_usd),
            successful_opportunities: total_processed,
        };
        run_manager
            .update_optimization_metrics(&totals)
            .map_err(|err| storage_classified(StageName::Storage, &err.to_string()))?;

        let elapsed = self.clock.now().millis_since(run_started);
        let final_results = json!({
            "new_stored": stored,
            "updated": updated,
            "skipped": skip_count,
            "filtered_out": filtered_out,
            "new_count": new_count,
            "update_count": update_count,
            "direct_update_skipped": direct.as_ref().map_or(0, |d| d.metrics.skipped),
            "total_opportunities_processed": total_processed,
        });
        run_manager
            .complete_run(elapsed, final_results)
            .map_err(|err| storage_classified(StageName::Storage, &err.to_string()))?;

        Ok(self.build_report(run_manager, source, stored, updated, skip_count, filtered_out, elapsed))
    }

    /// Stage 1: source analysis.
    fn stage_source_orchestrator(
        &self,
        run_manager: &RunManager,
        source: &Source,
        configuration: &SourceConfiguration,
        options: &ProcessOptions,
    ) -> Result<SourceAnalysis, ClassifiedError> {
        let stage = StageName::SourceOrchestrator;
        self.stage_preflight(run_manager, stage, options)?;
        run_manager
            .update_stage(StageUpdate::counts(stage, StageStatus::Processing, 0, 0))
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        let outcome = self.guarded(stage, &retry::CONSERVATIVE, run_manager, source, |_attempt| {
            self.analyzer.analyze(source, configuration).map_err(AttemptFailure::from)
        });
        let analysis = match outcome {
            Ok(retry_outcome) => retry_outcome.result,
            Err(classified) => {
                self.mark_stage_failed(run_manager, stage, &classified, 0);
                return Err(classified);
            }
        };
        let update = StageUpdate {
            stage_results: Some(json!({
                "endpoint": analysis.endpoint,
                "workflow": analysis.workflow,
                "confidence": analysis.confidence,
            })),
            tokens_used: analysis.token_usage,
            api_calls_made: analysis.api_calls,
            ..StageUpdate::counts(stage, StageStatus::Completed, 0, 1)
        };
        run_manager
            .update_stage(update)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        Ok(analysis)
    }

    /// Stage 2/3: raw fetch and data extraction.
    fn stage_data_extraction(
        &self,
        run_manager: &RunManager,
        source: &Source,
        configuration: &SourceConfiguration,
        analysis: &SourceAnalysis,
        options: &ProcessOptions,
    ) -> Result<ExtractionOutput, ClassifiedError> {
        let stage = StageName::DataExtraction;
        self.stage_preflight(run_manager, stage, options)?;
        run_manager
            .update_stage(StageUpdate::counts(stage, StageStatus::Processing, 1, 0))
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        let outcome = self.guarded(stage, &retry::DEFAULT, run_manager, source, |_attempt| {
            self.extractor.extract(source, configuration, analysis).map_err(AttemptFailure::from)
        });
        let extraction = match outcome {
            Ok(retry_outcome) => retry_outcome.result,
            Err(classified) => {
                self.mark_stage_failed(run_manager, stage, &classified, 1);
                return Err(classified);
            }
        };
        let extracted_count = count(&extraction.opportunities);
        let api_fetch = StageUpdate {
            api_calls_made: extraction.metrics.api_calls,
            stage_results: extraction
                .raw_response_id
                .as_ref()
                .map(|id| json!({ "raw_response_id": id })),
            ..StageUpdate::counts(
                StageName::ApiFetch,
                StageStatus::Completed,
                1,
                extraction.metrics.total_retrieved,
            )
        };
        run_manager
            .update_stage(api_fetch)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        let extraction_rate = if extraction.metrics.total_found == 0 {
            1.0
        } else {
            ratio(extracted_count, extraction.metrics.total_found)
        };
        let update = StageUpdate {
            stage_results: Some(json!({
                "total_available": extraction.metrics.total_found,
                "api_fetched_results": extraction.metrics.total_retrieved,
                "extracted_opportunities": extracted_count,
                "extraction_rate": extraction_rate,
            })),
            tokens_used: extraction.metrics.total_tokens,
            api_calls_made: extraction.metrics.api_calls,
            ..StageUpdate::counts(stage, StageStatus::Completed, 1, extracted_count)
        };
        run_manager
            .update_stage(update)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        Ok(extraction)
    }

    /// Stage 4: early duplicate detection.
    fn stage_duplicate_detection(
        &self,
        run_manager: &RunManager,
        source: &Source,
        extraction: &ExtractionOutput,
        force_requested: bool,
        options: &ProcessOptions,
    ) -> Result<DetectionOutput, ClassifiedError> {
        let stage = StageName::EarlyDuplicateDetector;
        let extracted_count = count(&extraction.opportunities);
        self.stage_preflight(run_manager, stage, options)?;
        run_manager
            .update_stage(StageUpdate::counts(stage, StageStatus::Processing, extracted_count, 0))
            .map_err(|err| storage_classified(stage, &err.to_string()))?;

        let run_id = run_manager.run_id().unwrap_or_else(RunId::generate);
        let detect_started = self.clock.now();
        let outcome = self.guarded(stage, &retry::DEFAULT, run_manager, source, |_attempt| {
            let detector =
                EarlyDuplicateDetector::new(self.store.as_ref(), DetectorConfig {
                    freshness_window_ms: self.config.freshness_window_ms,
                });
            detector
                .detect(
                    &run_id,
                    &source.source_id,
                    &extraction.opportunities,
                    force_requested,
                    self.clock.now(),
                )
                .map_err(AttemptFailure::from)
        });
        let mut detection = match outcome {
            Ok(retry_outcome) => retry_outcome.result,
            Err(classified) => {
                self.mark_stage_failed(run_manager, stage, &classified, extracted_count);
                return Err(classified);
            }
        };
        detection.session.detection_time_ms = self.clock.now().millis_since(detect_started);

        run_manager
            .record_detection_session(&detection.session)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;

        let continuing =
            detection.session.new_opportunities + detection.session.duplicates_to_update;
        let update = StageUpdate {
            stage_results: Some(json!({
                "new": detection.session.new_opportunities,
                "update": detection.session.duplicates_to_update,
                "skip": detection.session.duplicates_to_skip,
                "validation_failures": detection.session.validation_failures,
                "bypassed": force_requested,
                "reason": force_requested.then_some(REASON_FORCE_FULL_REPROCESSING),
            })),
            ..StageUpdate::counts(stage, StageStatus::Completed, extracted_count, continuing)
        };
        run_manager
            .update_stage(update)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        Ok(detection)
    }

    /// Branch A: analysis, filter, and storage over NEW records.
    fn branch_new(
        &self,
        run_manager: &RunManager,
        source: &Source,
        detection: &DetectionOutput,
        force_requested: bool,
        options: &ProcessOptions,
    ) -> Result<Option<NewBranchOutput>, ClassifiedError> {
        let new_records = &detection.new_opportunities;
        if new_records.is_empty() {
            self.skip_stage(run_manager, StageName::Analysis, "no_new_opportunities");
            self.skip_stage(run_manager, StageName::Filter, "no_new_opportunities");
            self.skip_stage(run_manager, StageName::Storage, "no_new_opportunities");
            return Ok(None);
        }
        let new_count = count(new_records);

        let analysis = self.stage_analysis(run_manager, source, new_records, options)?;
        let analyzed_count = count(&analysis.opportunities);
        self.validate_handoff(run_manager, StageName::Analysis, new_count, analyzed_count);

        let filter = self.stage_filter(run_manager, analysis.opportunities.clone(), options)?;
        let included_count = count(&filter.included_opportunities);

        let storage = if filter.included_opportunities.is_empty() {
            self.skip_stage(run_manager, StageName::Storage, "no_included_opportunities");
            StorageOutcome::default()
        } else {
            self.stage_storage(
                run_manager,
                source,
                &filter.included_opportunities,
                force_requested,
                options,
            )?
        };
        self.validate_handoff(
            run_manager,
            StageName::Storage,
            included_count,
            storage.metrics.new_opportunities + storage.metrics.updated,
        );

        Ok(Some(NewBranchOutput {
            analysis,
            filter,
            storage,
        }))
    }

    /// Stage 5: LM analysis.
    fn stage_analysis(
        &self,
        run_manager: &RunManager,
        source: &Source,
        new_records: &[ExtractedOpportunity],
        options: &ProcessOptions,
    ) -> Result<AnalysisOutput, ClassifiedError> {
        let stage = StageName::Analysis;
        let input_count = count(new_records);
        self.stage_preflight(run_manager, stage, options)?;
        run_manager
            .update_stage(StageUpdate::counts(stage, StageStatus::Processing, input_count, 0))
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        let outcome = self.guarded(stage, &retry::DEFAULT, run_manager, source, |_attempt| {
            self.analysis.enhance(new_records, source).map_err(AttemptFailure::from)
        });
        let output = match outcome {
            Ok(retry_outcome) => retry_outcome.result,
            Err(classified) => {
                self.mark_stage_failed(run_manager, stage, &classified, input_count);
                return Err(classified);
            }
        };
        let update = StageUpdate {
            tokens_used: output.metrics.total_tokens,
            api_calls_made: output.metrics.total_api_calls,
            ..StageUpdate::counts(
                stage,
                StageStatus::Completed,
                input_count,
                count(&output.opportunities),
            )
        };
        run_manager
            .update_stage(update)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        Ok(output)
    }

    /// Stage 6: deterministic filter.
    fn stage_filter(
        &self,
        run_manager: &RunManager,
        analyzed: Vec<AnalyzedOpportunity>,
        options: &ProcessOptions,
    ) -> Result<FilterOutput, ClassifiedError> {
        let stage = StageName::Filter;
        let input_count = count(&analyzed);
        self.stage_preflight(run_manager, stage, options)?;
        run_manager
            .update_stage(StageUpdate::counts(stage, StageStatus::Processing, input_count, 0))
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        let result = self.filter.filter(analyzed).map_err(AttemptFailure::from);
        let output = match result {
            Ok(output) => output,
            Err(failure) => {
                let classified = classify(stage, &failure);
                self.mark_stage_failed(run_manager, stage, &classified, input_count);
                return Err(classified);
            }
        };
        let update = StageUpdate {
            stage_results: Some(json!({
                "included": output.metrics.included,
                "excluded": output.metrics.excluded,
            })),
            ..StageUpdate::counts(
                stage,
                StageStatus::Completed,
                input_count,
                count(&output.included_opportunities),
            )
        };
        run_manager
            .update_stage(update)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        Ok(output)
    }

    /// Stage 7: canonical storage.
    fn stage_storage(
        &self,
        run_manager: &RunManager,
        source: &Source,
        included: &[AnalyzedOpportunity],
        force_requested: bool,
        options: &ProcessOptions,
    ) -> Result<StorageOutcome, ClassifiedError> {
        let stage = StageName::Storage;
        let input_count = count(included);
        self.stage_preflight(run_manager, stage, options)?;
        run_manager
            .update_stage(StageUpdate::counts(stage, StageStatus::Processing, input_count, 0))
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        let outcome = self.guarded(stage, &retry::AGGRESSIVE, run_manager, source, |_attempt| {
            self.storage.store(included, source, force_requested).map_err(AttemptFailure::from)
        });
        let output = match outcome {
            Ok(retry_outcome) => retry_outcome.result,
            Err(classified) => {
                self.mark_stage_failed(run_manager, stage, &classified, input_count);
                return Err(classified);
            }
        };
        let update = StageUpdate {
            stage_results: Some(json!({
                "new_opportunities": output.metrics.new_opportunities,
                "updated": output.metrics.updated,
                "failed": output.metrics.failed,
            })),
            ..StageUpdate::counts(
                stage,
                StageStatus::Completed,
                input_count,
                output.metrics.new_opportunities + output.metrics.updated,
            )
        };
        run_manager
            .update_stage(update)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        Ok(output)
    }

    /// Branch B: the direct-update fast path.
    fn branch_update(
        &self,
        run_manager: &RunManager,
        detection: &DetectionOutput,
        options: &ProcessOptions,
    ) -> Result<Option<DirectUpdateOutcome>, ClassifiedError> {
        let stage = StageName::DirectUpdate;
        let candidates = &detection.opportunities_to_update;
        if candidates.is_empty() {
            self.skip_stage(run_manager, stage, "no_update_opportunities");
            return Ok(None);
        }
        let input_count = count(candidates);
        self.stage_preflight(run_manager, stage, options)?;
        run_manager
            .update_stage(StageUpdate::counts(stage, StageStatus::Processing, input_count, 0))
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        let handler = DirectUpdateHandler::new(self.store.as_ref());
        let started = self.clock.now();
        let mut outcome = handler.process(candidates, self.clock.now());
        outcome.metrics.execution_time_ms = self.clock.now().millis_since(started);
        if outcome.metrics.failed == outcome.metrics.total_processed
            && outcome.metrics.total_processed > 0
        {
            let failure =
                AttemptFailure::message("direct update database writes failed for all candidates");
            let classified = classify(stage, &failure);
            self.mark_stage_failed(run_manager, stage, &classified, input_count);
            return Err(classified);
        }
        let update = StageUpdate {
            stage_results: Some(json!({
                "successful": outcome.metrics.successful,
                "failed": outcome.metrics.failed,
                "skipped": outcome.metrics.skipped,
            })),
            ..StageUpdate::counts(
                stage,
                StageStatus::Completed,
                input_count,
                outcome.metrics.total_processed,
            )
        };
        run_manager
            .update_stage(update)
            .map_err(|err| storage_classified(stage, &err.to_string()))?;
        Ok(Some(outcome))
    }

    // ------------------------------------------------------------------
    // Path analytics
    // ------------------------------------------------------------------

    /// Records per-opportunity paths once both branches are settled.
    fn record_paths(
        &self,
        run_manager: &RunManager,
        source: &Source,
        detection: &DetectionOutput,
        new_branch: &Option<NewBranchOutput>,
        direct: &Option<DirectUpdateOutcome>,
    ) {
        let Some(run_id) = run_manager.run_id() else {
            return;
        };

        if let Some(branch) = new_branch {
            let stored_api_ids = &branch.storage.stored_api_ids;
            let included: Vec<&AnalyzedOpportunity> =
                branch.filter.included_opportunities.iter().collect();
            for analyzed in &branch.analysis.opportunities {
                let api_id = analyzed.record.trimmed_api_id().unwrap_or_default().to_string();
                let was_included = included
                    .iter()
                    .any(|candidate| candidate.record == analyzed.record);
                let (outcome, stages) = if !was_included {
                    (FinalOutcome::FilteredOut, vec![
                        StageName::DataExtraction,
                        StageName::EarlyDuplicateDetector,
                        StageName::Analysis,
                        StageName::Filter,
                    ])
                } else if api_id.is_empty() || stored_api_ids.iter().any(|stored| stored == &api_id)
                {
                    (FinalOutcome::Stored, vec![
                        StageName::DataExtraction,
                        StageName::EarlyDuplicateDetector,
                        StageName::Analysis,
                        StageName::Filter,
                        StageName::Storage,
                    ])
                } else {
                    (FinalOutcome::Failed, vec![
                        StageName::DataExtraction,
                        StageName::EarlyDuplicateDetector,
                        StageName::Analysis,
                        StageName::Filter,
                        StageName::Storage,
                    ])
                };
                let _ = run_manager.record_opportunity_path(&OpportunityPath {
                    run_id: run_id.clone(),
                    api_opportunity_id: api_id,
                    title: analyzed.record.trimmed_title().unwrap_or_default().to_string(),
                    source_id: source.source_id.clone(),
                    path_type: PathType::New,
                    path_reason: new_path_reason(detection),
                    stages_processed: stages,
                    final_outcome: outcome,
                    tokens_used: analyzed.analysis.tokens_used,
                    processing_time_ms: 0,
                    cost_usd: token_cost(
                        analyzed.analysis.tokens_used,
                        self.config.cost_per_token_usd,
                    ),
                    duplicate_detected: false,
                    existing_opportunity_id: None,
                    changes_detected: Vec::new(),
                    duplicate_detection_method: None,
                    quality_score: Some(analyzed.analysis.relevance_score),
                });
            }
        }

        if let Some(outcome) = direct {
            for candidate in &detection.opportunities_to_update {
                let target = &candidate.existing.opportunity_id;
                let updated = outcome.successful.contains(target);
                let (final_outcome, reason) = if updated {
                    (FinalOutcome::Updated, candidate.reason.clone())
                } else if outcome.skipped.contains(target) {
                    (FinalOutcome::Failed, "concurrent_write_detected".to_string())
                } else {
                    (FinalOutcome::Failed, "direct_update_failed".to_string())
                };
                let _ = run_manager.record_opportunity_path(&OpportunityPath {
                    run_id: run_id.clone(),
                    api_opportunity_id: candidate
                        .api_record
                        .trimmed_api_id()
                        .unwrap_or_default()
                        .to_string(),
                    title: candidate.api_record.trimmed_title().unwrap_or_default().to_string(),
                    source_id: source.source_id.clone(),
                    path_type: PathType::Update,
                    path_reason: reason,
                    stages_processed: vec![
                        StageName::DataExtraction,
                        StageName::EarlyDuplicateDetector,
                        StageName::DirectUpdate,
                    ],
                    final_outcome,
                    tokens_used: 0,
                    processing_time_ms: outcome.metrics.execution_time_ms,
                    cost_usd: 0.0,
                    duplicate_detected: true,
                    existing_opportunity_id: Some(candidate.existing.opportunity_id.clone()),
                    changes_detected: candidate.changes.clone(),
                    duplicate_detection_method: Some(candidate.method),
                    quality_score: None,
                });
            }
        }

        for skip in &detection.opportunities_to_skip {
            let _ = run_manager.record_opportunity_path(&OpportunityPath {
                run_id: run_id.clone(),
                api_opportunity_id: skip
                    .api_record
                    .trimmed_api_id()
                    .unwrap_or_default()
                    .to_string(),
                title: skip.api_record.trimmed_title().unwrap_or_default().to_string(),
                source_id: source.source_id.clone(),
                path_type: PathType::Skip,
                path_reason: skip.reason.clone(),
                stages_processed: vec![
                    StageName::DataExtraction,
                    StageName::EarlyDuplicateDetector,
                ],
                final_outcome: FinalOutcome::Skipped,
                tokens_used: 0,
                processing_time_ms: 0,
                cost_usd: 0.0,
                duplicate_detected: skip.existing.is_some(),
                existing_opportunity_id: skip
                    .existing
                    .as_ref()
                    .map(|row| row.opportunity_id.clone()),
                changes_detected: Vec::new(),
                duplicate_detection_method: skip.method,
                quality_score: None,
            });
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Loads the source row and configuration bundle, failing closed.
    fn load_source(
        &self,
        source_id: &SourceId,
    ) -> Result<(Source, SourceConfiguration), RunFailure> {
        let stage = StageName::SourceOrchestrator;
        let source = match self.store.get_source(source_id) {
            Ok(Some(source)) => source,
            Ok(None) => {
                let failure = AttemptFailure::message(format!(
                    "source validation failed: unknown source {source_id}"
                ));
                return Err(self.failure_body(classify(stage, &failure), None));
            }
            Err(err) => {
                let failure = AttemptFailure::message(err.to_string());
                return Err(self.failure_body(classify(stage, &failure), None));
            }
        };
        let configuration = match self.store.get_configuration(source_id) {
            Ok(bundle) => bundle.unwrap_or_default(),
            Err(err) => {
                let failure = AttemptFailure::message(err.to_string());
                return Err(self.failure_body(classify(stage, &failure), None));
            }
        };
        Ok((source, configuration))
    }

    /// Runs timeout and cancellation checks before a stage.
    fn stage_preflight(
        &self,
        run_manager: &RunManager,
        stage: StageName,
        options: &ProcessOptions,
    ) -> Result<(), ClassifiedError> {
        run_manager.check_timeout(stage)?;
        if options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            let classified = ClassifiedError {
                category: ErrorCategory::ProcessingError,
                retryable: false,
                user_message: format!("run cancelled during {stage}"),
                original_message: "cancelled".to_string(),
                stage,
                status_code: None,
            };
            self.mark_stage_failed(run_manager, stage, &classified, 0);
            return Err(classified);
        }
        Ok(())
    }

    /// Executes an attempt function under the breaker and retry policy.
    fn guarded<T>(
        &self,
        stage: StageName,
        policy: &RetryPolicy,
        run_manager: &RunManager,
        source: &Source,
        attempt_fn: impl FnMut(u32) -> Result<T, AttemptFailure>,
    ) -> Result<retry::RetryOutcome<T>, ClassifiedError> {
        let key = format!("{}:{stage}", source.source_id);
        if self.config.circuit_breaker_enabled
            && self.breaker.admit(&key, self.clock.now()) == BreakerAdmission::Open
        {
            let failure =
                AttemptFailure::message(format!("circuit breaker open for {key}"));
            return Err(classify(stage, &failure));
        }
        let result = retry_stage(
            stage,
            policy,
            run_manager,
            self.waiter.as_ref(),
            self.clock.as_ref(),
            run_manager.deadline(),
            attempt_fn,
        );
        if self.config.circuit_breaker_enabled {
            match &result {
                Ok(_) => self.breaker.record_success(&key),
                Err(_) => self.breaker.record_failure(&key, self.clock.now()),
            }
        }
        let outcome = result?;
        // A stage that ran past the deadline fails as itself, not as its successor.
        run_manager.check_timeout(stage)?;
        Ok(outcome)
    }

    /// Marks a stage failed with the classified error attached.
    fn mark_stage_failed(
        &self,
        run_manager: &RunManager,
        stage: StageName,
        classified: &ClassifiedError,
        input_count: u64,
    ) {
        let update = StageUpdate {
            stage_results: Some(json!({
                "category": classified.category,
                "error": classified.original_message,
            })),
            ..StageUpdate::counts(stage, StageStatus::Failed, input_count, 0)
        };
        let _ = run_manager.update_stage(update);
    }

    /// Marks a stage skipped with a reason.
    fn skip_stage(&self, run_manager: &RunManager, stage: StageName, reason: &str) {
        let update = StageUpdate {
            stage_results: Some(json!({ "reason": reason })),
            ..StageUpdate::counts(stage, StageStatus::Skipped, 0, 0)
        };
        let _ = run_manager.update_stage(update);
    }

    /// Validates a count handoff and records a non-fatal warning on mismatch.
    fn validate_handoff(
        &self,
        run_manager: &RunManager,
        stage: StageName,
        expected: u64,
        actual: u64,
    ) {
        if expected != actual {
            run_manager.record_count_warning(format!(
                "count mismatch entering {stage}: expected {expected}, observed {actual}"
            ));
        }
    }

    /// Completes a run whose extraction produced no records.
    fn finish_empty_run(
        &self,
        run_manager: &RunManager,
        source: &Source,
        run_started: Timestamp,
        analysis: &SourceAnalysis,
        extraction: &ExtractionOutput,
    ) -> Result<RunReport, ClassifiedError> {
        for (stage, reason) in [
            (StageName::EarlyDuplicateDetector, "no_extracted_opportunities"),
            (StageName::Analysis, "no_new_opportunities"),
            (StageName::Filter, "no_new_opportunities"),
            (StageName::Storage, "no_new_opportunities"),
            (StageName::DirectUpdate, "no_update_opportunities"),
        ] {
            self.skip_stage(run_manager, stage, reason);
        }
        let run_id = run_manager.run_id().unwrap_or_else(RunId::generate);
        let session = crate::core::DuplicateDetectionSession {
            run_id,
            source_id: source.source_id.clone(),
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
        };
        run_manager
            .record_detection_session(&session)
            .map_err(|err| storage_classified(StageName::EarlyDuplicateDetector, &err.to_string()))?;

        let total_tokens = analysis.token_usage + extraction.metrics.total_tokens;
        let totals = OptimizationTotals {
            total_opportunities: 0,
            bypassed_llm: 0,
            total_tokens,
            total_api_calls: analysis.api_calls + extraction.metrics.api_calls,
            estimated_cost_usd: token_cost(total_tokens, self.config.cost_per_token_usd),
            successful_opportunities: 0,
        };
        run_manager
            .update_optimization_metrics(&totals)
            .map_err(|err| storage_classified(StageName::Storage, &err.to_string()))?;
        let elapsed = self.clock.now().millis_since(run_started);
        run_manager
            .complete_run(
                elapsed,
                json!({
                    "new_stored": 0,
                    "updated": 0,
                    "skipped": 0,
                    "filtered_out": 0,
                    "total_opportunities_processed": 0,
                }),
            )
            .map_err(|err| storage_classified(StageName::Storage, &err.to_string()))?;
        Ok(self.build_report(run_manager, source, 0, 0, 0, 0, elapsed))
    }

    /// Builds the completed-run report from the manager snapshot.
    fn build_report(
        &self,
        run_manager: &RunManager,
        source: &Source,
        stored: u64,
        updated: u64,
        skipped: u64,
        filtered_out: u64,
        elapsed: u64,
    ) -> RunReport {
        let snapshot = run_manager.snapshot_run();
        RunReport {
            status: "completed".to_string(),
            pipeline: self.config.pipeline_version.clone(),
            run_id: run_manager.run_id().unwrap_or_else(RunId::generate),
            source_id: source.source_id.clone(),
            new_stored: stored,
            updated,
            skipped,
            filtered_out,
            total_opportunities_processed: stored + updated,
            execution_time_ms: elapsed,
            metrics: snapshot.as_ref().map_or_else(DerivedMetrics::default, |run| run.derived.clone()),
            concurrent_processing_detected: snapshot
                .is_some_and(|run| run.concurrent_processing_detected),
        }
    }

    /// Builds the structured error body for the process boundary.
    fn failure_body(&self, classified: ClassifiedError, run_id: Option<RunId>) -> RunFailure {
        RunFailure {
            status: "error".to_string(),
            pipeline: self.config.pipeline_version.clone(),
            error: classified.original_message,
            category: classified.category,
            failed_stage: Some(classified.stage),
            run_id,
        }
    }
}

// ============================================================================
// SECTION: Branch Outputs
// ============================================================================

/// Collected outputs of the NEW branch.
struct NewBranchOutput {
    /// Analysis stage output.
    analysis: AnalysisOutput,
    /// Filter stage output.
    filter: FilterOutput,
    /// Storage stage output.
    storage: StorageOutcome,
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Length of a slice as a u64 counter.
fn count<T>(items: &[T]) -> u64 {
    u64::try_from(items.len()).unwrap_or(u64::MAX)
}

/// Ratio of two counters as f64.
#[allow(clippy::cast_precision_loss, reason = "Counters stay far below 2^52.")]
fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 { 0.0 } else { numerator as f64 / denominator as f64 }
}

/// Estimated USD cost for a token count.
#[allow(clippy::cast_precision_loss, reason = "Token counts stay far below 2^52.")]
fn token_cost(tokens: u64, cost_per_token_usd: f64) -> f64 {
    tokens as f64 * cost_per_token_usd
}

/// Classification for bookkeeping-write failures.
fn storage_classified(stage: StageName, message: &str) -> ClassifiedError {
    classify(stage, &AttemptFailure::message(format!("run storage error: {message}")))
}

/// Path reason for NEW records, honoring the force override.
fn new_path_reason(detection: &DetectionOutput) -> String {
    if detection.session.database_queries_made == 0
        && detection.session.new_opportunities == detection.session.total_opportunities_checked
        && detection.session.total_opportunities_checked > 0
    {
        REASON_FORCE_FULL_REPROCESSING.to_string()
    } else {
        crate::runtime::detector::REASON_NO_DUPLICATE_FOUND.to_string()
    }
}
