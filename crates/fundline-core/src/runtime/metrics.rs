// fundline-core/src/runtime/metrics.rs
// ============================================================================
// Module: Fundline Metrics Calculator
// Description: Pure derived-metric formulas over raw run counters.
// Purpose: Produce byte-identical throughput, cost, and SLA values across hosts.
// Dependencies: crate::core::run
// ============================================================================

//! ## Overview
//! Every derived metric is a pure function of primitive counters. Rounding
//! uses round-half-away-from-zero at the documented precision so dashboards
//! see identical values regardless of which component computed them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::run::SlaGrade;

// ============================================================================
// SECTION: Rounding
// ============================================================================

/// Rounds a value half-away-from-zero at the given decimal places.
#[must_use]
pub fn round_half_away(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let scale = 10_f64.powi(i32::try_from(decimals).unwrap_or(0));
    let scaled = value * scale;
    let rounded = if scaled >= 0.0 { (scaled + 0.5).floor() } else { (scaled - 0.5).ceil() };
    rounded / scale
}

// ============================================================================
// SECTION: Throughput and Cost
// ============================================================================

/// Opportunities per minute, 2 decimals; zero when no time elapsed.
#[must_use]
pub fn opportunities_per_minute(total_opportunities: u64, total_execution_time_ms: u64) -> f64 {
    if total_execution_time_ms == 0 {
        return 0.0;
    }
    let minutes = to_f64(total_execution_time_ms) / 60_000.0;
    round_half_away(to_f64(total_opportunities) / minutes, 2)
}

/// Tokens per opportunity, 2 decimals; zero when nothing was processed.
#[must_use]
pub fn tokens_per_opportunity(total_tokens: u64, total_opportunities: u64) -> f64 {
    if total_opportunities == 0 {
        return 0.0;
    }
    round_half_away(to_f64(total_tokens) / to_f64(total_opportunities), 2)
}

/// Cost per opportunity in USD, 4 decimals; zero when nothing was processed.
#[must_use]
pub fn cost_per_opportunity_usd(total_cost_usd: f64, total_opportunities: u64) -> f64 {
    if total_opportunities == 0 {
        return 0.0;
    }
    round_half_away(total_cost_usd / to_f64(total_opportunities), 4)
}

/// Success rate percentage bounded to [0, 100], 2 decimals.
#[must_use]
pub fn success_rate_percentage(failure_count: u64, total_opportunities: u64) -> f64 {
    let denominator = to_f64(total_opportunities.max(1));
    let rate = (1.0 - to_f64(failure_count) / denominator) * 100.0;
    round_half_away(rate.clamp(0.0, 100.0), 2)
}

// ============================================================================
// SECTION: SLA Compliance
// ============================================================================

/// SLA targets for the weighted compliance score.
///
/// # Invariants
/// - All targets are strictly positive after validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlaTargets {
    /// Minimum opportunities per minute.
    pub min_opportunities_per_minute: f64,
    /// Minimum success-rate percentage.
    pub min_success_rate_percentage: f64,
    /// Maximum cost per opportunity in USD.
    pub max_cost_per_opportunity_usd: f64,
    /// Maximum total run time in milliseconds.
    pub max_total_time_ms: u64,
}

impl Default for SlaTargets {
    fn default() -> Self {
        Self {
            min_opportunities_per_minute: 1.0,
            min_success_rate_percentage: 90.0,
            max_cost_per_opportunity_usd: 0.05,
            max_total_time_ms: 300_000,
        }
    }
}

/// Raw inputs for the weighted SLA score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SlaInputs {
    /// Achieved opportunities per minute.
    pub opportunities_per_minute: f64,
    /// Achieved success-rate percentage.
    pub success_rate_percentage: f64,
    /// Achieved cost per opportunity in USD.
    pub cost_per_opportunity_usd: f64,
    /// Total run time in milliseconds.
    pub total_execution_time_ms: u64,
}

/// Sub-score weight for throughput.
const WEIGHT_THROUGHPUT: f64 = 0.25;
/// Sub-score weight for success rate.
const WEIGHT_SUCCESS: f64 = 0.35;
/// Sub-score weight for cost per opportunity.
const WEIGHT_COST: f64 = 0.15;
/// Sub-score weight for total time.
const WEIGHT_TIME: f64 = 0.25;

/// Weighted SLA compliance percentage in [0, 100], 2 decimals.
///
/// Each sub-score is the achieved value relative to its target, capped at
/// 100; cost and time invert the ratio so exceeding the budget degrades the
/// score monotonically.
#[must_use]
pub fn sla_compliance_percentage(inputs: &SlaInputs, targets: &SlaTargets) -> f64 {
    let throughput = ratio_score(inputs.opportunities_per_minute, targets.min_opportunities_per_minute);
    let success =
        ratio_score(inputs.success_rate_percentage, targets.min_success_rate_percentage);
    let cost =
        inverse_ratio_score(inputs.cost_per_opportunity_usd, targets.max_cost_per_opportunity_usd);
    let time = inverse_ratio_score(
        to_f64(inputs.total_execution_time_ms),
        to_f64(targets.max_total_time_ms),
    );
    let weighted = throughput.mul_add(
        WEIGHT_THROUGHPUT,
        success.mul_add(WEIGHT_SUCCESS, cost.mul_add(WEIGHT_COST, time * WEIGHT_TIME)),
    );
    round_half_away(weighted.clamp(0.0, 100.0), 2)
}

/// Letter grade for a compliance percentage.
#[must_use]
pub fn sla_grade(compliance_percentage: f64) -> SlaGrade {
    if compliance_percentage >= 90.0 {
        SlaGrade::A
    } else if compliance_percentage >= 80.0 {
        SlaGrade::B
    } else if compliance_percentage >= 70.0 {
        SlaGrade::C
    } else if compliance_percentage >= 60.0 {
        SlaGrade::D
    } else {
        SlaGrade::F
    }
}

/// Achieved-over-target score capped at 100; zero when the target is zero.
fn ratio_score(achieved: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return 0.0;
    }
    ((achieved / target) * 100.0).clamp(0.0, 100.0)
}

/// Target-over-achieved score: full marks within budget, degrading beyond it.
fn inverse_ratio_score(achieved: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return 0.0;
    }
    if achieved <= target {
        return 100.0;
    }
    ((target / achieved) * 100.0).clamp(0.0, 100.0)
}

/// Converts a counter to f64 for ratio math.
#[allow(clippy::cast_precision_loss, reason = "Counters stay far below 2^52 in practice.")]
const fn to_f64(value: u64) -> f64 {
    value as f64
}
