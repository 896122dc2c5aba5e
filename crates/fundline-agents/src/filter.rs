// fundline-agents/src/filter.rs
// ============================================================================
// Module: Opportunity Filter
// Description: Deterministic relevance-threshold filter.
// Purpose: Drop low-scoring analyzed records before storage.
// Dependencies: fundline-core
// ============================================================================

//! ## Overview
//! The filter is pure and deterministic: a record passes iff its relevance
//! score meets the threshold. Identical inputs always yield identical
//! outputs, in input order.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Instant;

use fundline_core::interfaces::AnalyzedOpportunity;
use fundline_core::interfaces::FilterError;
use fundline_core::interfaces::FilterOutput;
use fundline_core::interfaces::OpportunityFilter;

// ============================================================================
// SECTION: Threshold Filter
// ============================================================================

/// Default minimum relevance score for inclusion.
pub const DEFAULT_MIN_RELEVANCE_SCORE: f64 = 5.0;

/// Relevance-threshold filter.
///
/// # Invariants
/// - `min_relevance_score` lies in [0, 10].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreThresholdFilter {
    /// Minimum relevance score a record must reach.
    pub min_relevance_score: f64,
}

impl Default for ScoreThresholdFilter {
    fn default() -> Self {
        Self {
            min_relevance_score: DEFAULT_MIN_RELEVANCE_SCORE,
        }
    }
}

impl OpportunityFilter for ScoreThresholdFilter {
    fn filter(&self, enhanced: Vec<AnalyzedOpportunity>) -> Result<FilterOutput, FilterError> {
        let started = Instant::now();
        let mut output = FilterOutput::default();
        for analyzed in enhanced {
            if analyzed.analysis.relevance_score >= self.min_relevance_score {
                output.metrics.included += 1;
                output.included_opportunities.push(analyzed);
            } else {
                output.metrics.excluded += 1;
            }
        }
        output.metrics.execution_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(output)
    }
}
