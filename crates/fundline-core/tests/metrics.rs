// fundline-core/tests/metrics.rs
// ============================================================================
// Module: Metrics Calculator Unit Tests
// Description: Derived-metric formulas, rounding, and SLA grading.
// Purpose: Pin byte-identical metric values and the SLA monotonicity law.
// ============================================================================

//! Metric formula tests: throughput, tokens, cost, success rate, weighted
//! SLA compliance, grading bands, and round-half-away-from-zero behavior.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::float_cmp,
    reason = "Test-only assertions against exact rounded values are permitted."
)]

use fundline_core::SlaGrade;
use fundline_core::runtime::SlaInputs;
use fundline_core::runtime::SlaTargets;
use fundline_core::runtime::metrics::cost_per_opportunity_usd;
use fundline_core::runtime::metrics::opportunities_per_minute;
use fundline_core::runtime::metrics::round_half_away;
use fundline_core::runtime::metrics::sla_compliance_percentage;
use fundline_core::runtime::metrics::sla_grade;
use fundline_core::runtime::metrics::success_rate_percentage;
use fundline_core::runtime::metrics::tokens_per_opportunity;

// ============================================================================
// SECTION: Rounding
// ============================================================================

#[test]
fn rounding_is_half_away_from_zero() {
    assert_eq!(round_half_away(2.5, 0), 3.0);
    assert_eq!(round_half_away(-2.5, 0), -3.0);
    assert_eq!(round_half_away(2.344, 2), 2.34);
    assert_eq!(round_half_away(2.346, 2), 2.35);
    assert_eq!(round_half_away(-2.346, 2), -2.35);
    assert_eq!(round_half_away(f64::NAN, 2), 0.0);
    assert_eq!(round_half_away(f64::INFINITY, 2), 0.0);
}

// ============================================================================
// SECTION: Throughput and Cost
// ============================================================================

#[test]
fn throughput_formula_rounds_to_two_decimals() {
    // 7 opportunities over 3 minutes.
    assert_eq!(opportunities_per_minute(7, 180_000), 2.33);
    assert_eq!(opportunities_per_minute(0, 60_000), 0.0);
    assert_eq!(opportunities_per_minute(5, 0), 0.0);
}

#[test]
fn tokens_formula_rounds_to_two_decimals() {
    assert_eq!(tokens_per_opportunity(1_000, 3), 333.33);
    assert_eq!(tokens_per_opportunity(10, 0), 0.0);
}

#[test]
fn cost_formula_rounds_to_four_decimals() {
    assert_eq!(cost_per_opportunity_usd(0.1, 3), 0.033_3);
    assert_eq!(cost_per_opportunity_usd(1.0, 0), 0.0);
}

#[test]
fn success_rate_is_bounded() {
    assert_eq!(success_rate_percentage(0, 10), 100.0);
    assert_eq!(success_rate_percentage(1, 10), 90.0);
    assert_eq!(success_rate_percentage(5, 0), 0.0);
    assert_eq!(success_rate_percentage(0, 0), 100.0);
}

// ============================================================================
// SECTION: SLA Compliance
// ============================================================================

/// Inputs meeting every default target.
fn perfect_inputs() -> SlaInputs {
    SlaInputs {
        opportunities_per_minute: 2.0,
        success_rate_percentage: 100.0,
        cost_per_opportunity_usd: 0.01,
        total_execution_time_ms: 60_000,
    }
}

#[test]
fn perfect_run_scores_full_compliance() {
    let compliance = sla_compliance_percentage(&perfect_inputs(), &SlaTargets::default());
    assert_eq!(compliance, 100.0);
    assert_eq!(sla_grade(compliance), SlaGrade::A);
}

#[test]
fn grades_follow_fixed_bands() {
    assert_eq!(sla_grade(95.0), SlaGrade::A);
    assert_eq!(sla_grade(90.0), SlaGrade::A);
    assert_eq!(sla_grade(85.0), SlaGrade::B);
    assert_eq!(sla_grade(75.0), SlaGrade::C);
    assert_eq!(sla_grade(65.0), SlaGrade::D);
    assert_eq!(sla_grade(59.99), SlaGrade::F);
}

#[test]
fn zero_run_scores_cost_and_time_only() {
    let inputs = SlaInputs {
        opportunities_per_minute: 0.0,
        success_rate_percentage: 0.0,
        cost_per_opportunity_usd: 0.0,
        total_execution_time_ms: 1_000,
    };
    // Throughput and success contribute zero; cost and time are in budget.
    let compliance = sla_compliance_percentage(&inputs, &SlaTargets::default());
    assert_eq!(compliance, 40.0);
    assert_eq!(sla_grade(compliance), SlaGrade::F);
}

#[test]
fn increasing_time_never_increases_compliance() {
    let targets = SlaTargets::default();
    let mut previous = f64::INFINITY;
    for minutes in 1..=30_u64 {
        let elapsed = minutes * 60_000;
        let inputs = SlaInputs {
            opportunities_per_minute: opportunities_per_minute(10, elapsed),
            success_rate_percentage: 100.0,
            cost_per_opportunity_usd: 0.01,
            total_execution_time_ms: elapsed,
        };
        let compliance = sla_compliance_percentage(&inputs, &targets);
        assert!(
            compliance <= previous,
            "compliance rose from {previous} to {compliance} at {minutes} minutes"
        );
        previous = compliance;
    }
}

#[test]
fn cost_overruns_degrade_monotonically() {
    let targets = SlaTargets::default();
    let base = perfect_inputs();
    let mut previous = f64::INFINITY;
    for step in 1..=10_u64 {
        let inputs = SlaInputs {
            cost_per_opportunity_usd: 0.05 + 0.01 * to_f64(step),
            ..base
        };
        let compliance = sla_compliance_percentage(&inputs, &targets);
        assert!(compliance <= previous);
        previous = compliance;
    }
}

/// Converts a counter to f64 for test arithmetic.
#[allow(clippy::cast_precision_loss, reason = "Test counters are tiny.")]
const fn to_f64(value: u64) -> f64 {
    value as f64
}
