// fundline-core/tests/proptest_metrics.rs
// ============================================================================
// Module: Metrics Property Tests
// Description: Bounds and monotonicity laws over randomized counters.
// Purpose: Hold the SLA formulas to their contracts across the input space.
// ============================================================================

//! Property tests: compliance stays within [0, 100], success rate stays
//! bounded, and holding counters constant while growing execution time
//! never raises compliance.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    reason = "Test-only assertions and helpers are permitted."
)]

use fundline_core::runtime::SlaInputs;
use fundline_core::runtime::SlaTargets;
use fundline_core::runtime::metrics::cost_per_opportunity_usd;
use fundline_core::runtime::metrics::opportunities_per_minute;
use fundline_core::runtime::metrics::sla_compliance_percentage;
use fundline_core::runtime::metrics::success_rate_percentage;
use proptest::prelude::*;

proptest! {
    #[test]
    fn compliance_is_always_bounded(
        throughput in 0.0_f64..10_000.0,
        success in 0.0_f64..100.0,
        cost in 0.0_f64..10.0,
        elapsed in 0_u64..86_400_000,
    ) {
        let inputs = SlaInputs {
            opportunities_per_minute: throughput,
            success_rate_percentage: success,
            cost_per_opportunity_usd: cost,
            total_execution_time_ms: elapsed,
        };
        let compliance = sla_compliance_percentage(&inputs, &SlaTargets::default());
        prop_assert!((0.0..=100.0).contains(&compliance));
    }

    #[test]
    fn success_rate_is_always_bounded(failures in 0_u64..1_000, total in 0_u64..1_000) {
        let rate = success_rate_percentage(failures, total);
        prop_assert!((0.0..=100.0).contains(&rate));
    }

    #[test]
    fn longer_runs_never_score_higher(
        opportunities in 1_u64..500,
        tokens_cost in 0.0_f64..0.2,
        base_elapsed in 1_000_u64..600_000,
        extra in 1_u64..600_000,
    ) {
        let targets = SlaTargets::default();
        let score = |elapsed: u64| {
            let inputs = SlaInputs {
                opportunities_per_minute: opportunities_per_minute(opportunities, elapsed),
                success_rate_percentage: 100.0,
                cost_per_opportunity_usd: cost_per_opportunity_usd(tokens_cost, opportunities),
                total_execution_time_ms: elapsed,
            };
            sla_compliance_percentage(&inputs, &targets)
        };
        let shorter = score(base_elapsed);
        let longer = score(base_elapsed + extra);
        prop_assert!(longer <= shorter + 1e-9);
    }
}
