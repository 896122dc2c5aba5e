// fundline-core/src/runtime/direct_update.rs
// ============================================================================
// Module: Fundline Direct-Update Handler
// Description: Minimal field updates for changed duplicates.
// Purpose: Apply UPDATE-class changes without invoking the LM stages.
// Dependencies: crate::core, crate::interfaces, crate::runtime::detector
// ============================================================================

//! ## Overview
//! The direct-update fast path applies only the fields the detector found
//! changed, plus the freshness marker. Writes are conditional on the row
//! revision observed during detection; a concurrent write is counted as a
//! skip, never retried.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::FieldPatch;
use crate::core::OpportunityId;
use crate::core::Timestamp;
use crate::interfaces::OpportunityStore;
use crate::interfaces::UpdateApplied;
use crate::runtime::detector::UpdateCandidate;

// ============================================================================
// SECTION: Output Shapes
// ============================================================================

/// One failed direct update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectUpdateFailure {
    /// Target canonical row.
    pub opportunity_id: OpportunityId,
    /// Failure description.
    pub error: String,
}

/// Metrics for one direct-update pass.
///
/// # Invariants
/// - `total_processed == successful + failed + skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DirectUpdateMetrics {
    /// Candidates processed.
    pub total_processed: u64,
    /// Updates applied.
    pub successful: u64,
    /// Updates that failed.
    pub failed: u64,
    /// Updates skipped after a concurrent write was detected.
    pub skipped: u64,
    /// Pass wall time in milliseconds.
    pub execution_time_ms: u64,
}

/// Result of one direct-update pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DirectUpdateOutcome {
    /// Rows updated, in input order.
    pub successful: Vec<OpportunityId>,
    /// Rows that failed, in input order.
    pub failed: Vec<DirectUpdateFailure>,
    /// Rows skipped on revision conflicts, in input order.
    pub skipped: Vec<OpportunityId>,
    /// Pass metrics.
    pub metrics: DirectUpdateMetrics,
}

// ============================================================================
// SECTION: Handler
// ============================================================================

/// Direct-update handler over the canonical opportunity store.
pub struct DirectUpdateHandler<'a> {
    /// Canonical store receiving conditional updates.
    store: &'a dyn OpportunityStore,
}

impl<'a> DirectUpdateHandler<'a> {
    /// Creates a handler over the given store.
    #[must_use]
    pub const fn new(store: &'a dyn OpportunityStore) -> Self {
        Self {
            store,
        }
    }

    /// Applies the UPDATE list from the detector.
    ///
    /// Each candidate patches only its changed fields; a revision conflict
    /// counts the candidate as skipped. Store-level failures are captured
    /// per candidate and never abort the pass; the caller decides whether
    /// an all-failed pass fails the stage.
    #[must_use]
    pub fn process(&self, candidates: &[UpdateCandidate], now: Timestamp) -> DirectUpdateOutcome {
        let mut outcome = DirectUpdateOutcome::default();
        for candidate in candidates {
            let patches: Vec<FieldPatch> = candidate
                .changes
                .iter()
                .map(|field| FieldPatch::from_extracted(*field, &candidate.api_record))
                .collect();
            let target = candidate.existing.opportunity_id.clone();
            match self.store.apply_field_patches(
                &target,
                &patches,
                candidate.existing.revision,
                now,
            ) {
                Ok(UpdateApplied::Applied) => {
                    outcome.metrics.successful += 1;
                    outcome.successful.push(target);
                }
                Ok(UpdateApplied::VersionConflict) => {
                    outcome.metrics.skipped += 1;
                    outcome.skipped.push(target);
                }
                Ok(UpdateApplied::Missing) => {
                    outcome.metrics.failed += 1;
                    outcome.failed.push(DirectUpdateFailure {
                        opportunity_id: target,
                        error: "canonical row no longer exists".to_string(),
                    });
                }
                Err(err) => {
                    outcome.metrics.failed += 1;
                    outcome.failed.push(DirectUpdateFailure {
                        opportunity_id: target,
                        error: err.to_string(),
                    });
                }
            }
        }
        outcome.metrics.total_processed =
            outcome.metrics.successful + outcome.metrics.failed + outcome.metrics.skipped;
        outcome
    }
}
