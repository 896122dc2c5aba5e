// fundline-agents/src/storage.rs
// ============================================================================
// Module: Storage Agent
// Description: Canonical persistence of included opportunities.
// Purpose: Insert new rows, refresh existing ones idempotently, and validate
//          canonical invariants before any write.
// Dependencies: fundline-core
// ============================================================================

//! ## Overview
//! The storage agent persists filtered records into the canonical store.
//! Re-storing an already-stored external identifier is a no-op insert: the
//! existing row is refreshed in place (which force-reprocessing runs rely
//! on) and counted under `updated`. Records violating canonical invariants
//! are counted as failed, never partially written.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use fundline_core::Opportunity;
use fundline_core::OpportunityId;
use fundline_core::Source;
use fundline_core::interfaces::AnalyzedOpportunity;
use fundline_core::interfaces::OpportunityStore;
use fundline_core::interfaces::StorageAgent;
use fundline_core::interfaces::StorageAgentError;
use fundline_core::interfaces::StorageOutcome;
use fundline_core::interfaces::UpdateApplied;
use fundline_core::time::Clock;

// ============================================================================
// SECTION: Storage Agent
// ============================================================================

/// Storage agent over the canonical opportunity store.
pub struct DatastoreStorageAgent {
    /// Canonical store receiving writes.
    store: Arc<dyn OpportunityStore>,
    /// Clock for row stamps.
    clock: Arc<dyn Clock>,
}

impl DatastoreStorageAgent {
    /// Creates a storage agent over the given store and clock.
    #[must_use]
    pub fn new(store: Arc<dyn OpportunityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
        }
    }
}

impl StorageAgent for DatastoreStorageAgent {
    fn store(
        &self,
        included: &[AnalyzedOpportunity],
        source: &Source,
        _force_full_reprocessing: bool,
    ) -> Result<StorageOutcome, StorageAgentError> {
        let started = Instant::now();
        let now = self.clock.now();
        let api_ids: Vec<String> = included
            .iter()
            .filter_map(|analyzed| analyzed.record.trimmed_api_id().map(str::to_string))
            .collect();
        let existing = self
            .store
            .find_by_api_ids(&source.source_id, &api_ids)
            .map_err(|err| StorageAgentError::Store(err.to_string()))?;

        let mut outcome = StorageOutcome::default();
        for analyzed in included {
            let Some(api_id) = analyzed.record.trimmed_api_id() else {
                outcome.metrics.failed += 1;
                continue;
            };
            if validate_record(analyzed).is_err() {
                outcome.metrics.failed += 1;
                continue;
            }
            let prior = existing
                .iter()
                .find(|row| row.api_opportunity_id.trim() == api_id);
            match prior {
                Some(row) => {
                    let refreshed = build_row(
                        analyzed,
                        source,
                        row.opportunity_id.clone(),
                        row.created_at,
                        now,
                        row.revision,
                    );
                    match self.store.update_opportunity(&refreshed, row.revision) {
                        Ok(UpdateApplied::Applied) => {
                            outcome.metrics.updated += 1;
                            outcome.stored_ids.push(row.opportunity_id.clone());
                            outcome.stored_api_ids.push(api_id.to_string());
                        }
                        Ok(UpdateApplied::VersionConflict | UpdateApplied::Missing) | Err(_) => {
                            outcome.metrics.failed += 1;
                        }
                    }
                }
                None => {
                    let row = build_row(
                        analyzed,
                        source,
                        OpportunityId::generate(),
                        now,
                        now,
                        0,
                    );
                    match self.store.insert_opportunity(&row) {
                        Ok(()) => {
                            outcome.metrics.new_opportunities += 1;
                            outcome.stored_ids.push(row.opportunity_id);
                            outcome.stored_api_ids.push(api_id.to_string());
                        }
                        Err(_) => {
                            outcome.metrics.failed += 1;
                        }
                    }
                }
            }
        }
        outcome.metrics.execution_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(outcome)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Validates canonical invariants before a write.
fn validate_record(analyzed: &AnalyzedOpportunity) -> Result<(), &'static str> {
    let record = &analyzed.record;
    if record.trimmed_title().is_none() {
        return Err("title is required");
    }
    for amount in [record.min_award, record.max_award, record.total_funding].into_iter().flatten() {
        if amount < 0.0 {
            return Err("award amounts must be non-negative");
        }
    }
    if let (Some(open), Some(close)) = (record.open_date, record.close_date)
        && close < open
    {
        return Err("close date precedes open date");
    }
    Ok(())
}

/// Builds the canonical row for an analyzed record.
fn build_row(
    analyzed: &AnalyzedOpportunity,
    source: &Source,
    opportunity_id: OpportunityId,
    created_at: fundline_core::Timestamp,
    updated_at: fundline_core::Timestamp,
    revision: u64,
) -> Opportunity {
    let record = &analyzed.record;
    Opportunity {
        opportunity_id,
        source_id: source.source_id.clone(),
        api_opportunity_id: record.trimmed_api_id().unwrap_or_default().to_string(),
        title: record.trimmed_title().unwrap_or_default().to_string(),
        description: record.description.clone(),
        funding_type: record.funding_type.clone(),
        agency: record.agency.clone(),
        min_award: record.min_award,
        max_award: record.max_award,
        total_funding: record.total_funding,
        open_date: record.open_date,
        close_date: record.close_date,
        eligibility: record.eligibility.clone(),
        url: record.url.clone(),
        analysis: Some(analyzed.analysis.clone()),
        created_at,
        updated_at,
        revision,
    }
}
