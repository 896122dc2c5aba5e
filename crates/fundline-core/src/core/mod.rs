// fundline-core/src/core/mod.rs
// ============================================================================
// Module: Fundline Core Types
// Description: Canonical Fundline schema and run-record structures.
// Purpose: Provide stable, serializable types for sources, opportunities, and runs.
// Dependencies: serde, serde_json, thiserror, time, uuid
// ============================================================================

//! ## Overview
//! Fundline core types define source descriptions, canonical opportunity
//! records, run bookkeeping, and the failure taxonomy. These types are the
//! canonical source of truth for every derived API surface (HTTP admin or
//! batch worker).

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod errors;
pub mod identifiers;
pub mod opportunity;
pub mod run;
pub mod source;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use errors::AttemptFailure;
pub use errors::ClassifiedError;
pub use errors::ErrorCategory;
pub use errors::classify;
pub use errors::timeout_error;
pub use identifiers::IdentifierError;
pub use identifiers::JobId;
pub use identifiers::OpportunityId;
pub use identifiers::RunId;
pub use identifiers::SourceId;
pub use opportunity::ExtractedOpportunity;
pub use opportunity::FieldPatch;
pub use opportunity::FieldValue;
pub use opportunity::MaterialField;
pub use opportunity::Opportunity;
pub use opportunity::OpportunityAnalysis;
pub use opportunity::RawResponse;
pub use opportunity::normalize_title;
pub use run::DerivedMetrics;
pub use run::DetectionMethod;
pub use run::DuplicateDetectionSession;
pub use run::FinalOutcome;
pub use run::OpportunityPath;
pub use run::PathType;
pub use run::RetryAttempt;
pub use run::Run;
pub use run::RunStatus;
pub use run::RunTotals;
pub use run::SlaGrade;
pub use run::StageName;
pub use run::StageRecord;
pub use run::StageStatus;
pub use source::ApiKeyLocation;
pub use source::AuthDescriptor;
pub use source::CanonicalField;
pub use source::DetailConfig;
pub use source::HandlerType;
pub use source::HttpMethod;
pub use source::PaginationConfig;
pub use source::PaginationScheme;
pub use source::ParamPlacement;
pub use source::RequestConfig;
pub use source::ResponseMapping;
pub use source::Source;
pub use source::SourceConfiguration;
pub use source::SourceType;
pub use source::UpdateCadence;
pub use time::Clock;
pub use time::ManualClock;
pub use time::SystemClock;
pub use time::Timestamp;
