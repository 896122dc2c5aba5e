// fundline-core/src/lib.rs
// ============================================================================
// Module: Fundline Core Library
// Description: Public API surface for the Fundline ingestion core.
// Purpose: Expose core types, collaborator contracts, and the pipeline runtime.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Fundline core provides the configurable ingestion pipeline for funding
//! opportunity records: typed source descriptions, early duplicate
//! classification against the canonical store, a direct-update fast path,
//! and per-stage run bookkeeping. It is backend-agnostic and integrates
//! through explicit interfaces rather than embedding into host frameworks.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::AdvisoryLock;
pub use interfaces::AnalysisAgent;
pub use interfaces::AnalysisError;
pub use interfaces::AnalysisMetrics;
pub use interfaces::AnalysisOutput;
pub use interfaces::AnalyzedOpportunity;
pub use interfaces::AnalyzerError;
pub use interfaces::DataExtractor;
pub use interfaces::Datastore;
pub use interfaces::DatastoreError;
pub use interfaces::ExtractError;
pub use interfaces::ExtractionMetrics;
pub use interfaces::ExtractionOutput;
pub use interfaces::FilterError;
pub use interfaces::FilterMetrics;
pub use interfaces::FilterOutput;
pub use interfaces::LanguageModel;
pub use interfaces::LmError;
pub use interfaces::LmRequest;
pub use interfaces::LmResponse;
pub use interfaces::LockHandle;
pub use interfaces::OpportunityFilter;
pub use interfaces::OpportunityStore;
pub use interfaces::RawResponseStore;
pub use interfaces::RunStore;
pub use interfaces::RunWrite;
pub use interfaces::SourceAnalysis;
pub use interfaces::SourceAnalyzer;
pub use interfaces::SourceStore;
pub use interfaces::StorageAgent;
pub use interfaces::StorageAgentError;
pub use interfaces::StorageMetrics;
pub use interfaces::StorageOutcome;
pub use interfaces::SystemConfigStore;
pub use interfaces::UpdateApplied;
pub use interfaces::WorkflowKind;
pub use runtime::GLOBAL_FORCE_FLAG_KEY;
pub use runtime::InMemoryDatastore;
pub use runtime::PipelineConfig;
pub use runtime::PipelineCoordinator;
pub use runtime::PipelineParts;
pub use runtime::ProcessOptions;
pub use runtime::ProcessOutcome;
pub use runtime::RunFailure;
pub use runtime::RunManager;
pub use runtime::RunManagerConfig;
pub use runtime::RunReport;
pub use runtime::SharedDatastore;
pub use runtime::cleanup_orphaned_runs;
