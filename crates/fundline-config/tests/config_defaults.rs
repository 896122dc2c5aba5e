// fundline-config/tests/config_defaults.rs
// ============================================================================
// Module: Config Defaults and Override Tests
// Description: TOML loading, environment overrides, and limit enforcement.
// Purpose: Pin the fail-closed configuration contract.
// ============================================================================

//! Config tests: defaults without a file, TOML parsing, the environment
//! overrides the core consumes, and validation limits.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::float_cmp,
    reason = "Test-only assertions and helpers are permitted."
)]
#![allow(
    unsafe_code,
    clippy::undocumented_unsafe_blocks,
    reason = "The override test mutates process environment variables."
)]

use std::fs;

use fundline_config::ENV_RUN_TIMEOUT_MS;
use fundline_config::ENV_SLA_MAX_TOTAL_TIME_MS;
use fundline_config::FundlineConfig;
use tempfile::TempDir;

// ============================================================================
// SECTION: Defaults and Files
// ============================================================================

#[test]
fn missing_files_yield_validated_defaults() {
    let dir = TempDir::new().unwrap();
    let config = FundlineConfig::load_from(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.pipeline.version, "v2");
    assert_eq!(config.pipeline.run_timeout_ms, 1_800_000);
    assert_eq!(config.pipeline.freshness_window_ms, 86_400_000);
    assert_eq!(config.sla.min_success_rate_percentage, 90.0);
    assert_eq!(config.server.similarity_threshold, 0.85);
}

#[test]
fn toml_files_override_sections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fundline.toml");
    fs::write(
        &path,
        "[pipeline]\nrun_timeout_ms = 600000\n\n[server]\nsimilarity_threshold = 0.9\n",
    )
    .unwrap();
    let config = FundlineConfig::load_from(&path).unwrap();
    assert_eq!(config.pipeline.run_timeout_ms, 600_000);
    assert_eq!(config.server.similarity_threshold, 0.9);
    // Untouched sections keep their defaults.
    assert_eq!(config.pipeline.version, "v2");
}

#[test]
fn malformed_toml_fails_closed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fundline.toml");
    fs::write(&path, "pipeline = not valid").unwrap();
    assert!(FundlineConfig::load_from(&path).is_err());
}

// ============================================================================
// SECTION: Environment Overrides
// ============================================================================

#[test]
fn environment_overrides_apply_and_reject_garbage() {
    // One test owns all env mutation so parallel tests never race on it.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");

    unsafe {
        std::env::set_var(ENV_RUN_TIMEOUT_MS, "900000");
        std::env::set_var(ENV_SLA_MAX_TOTAL_TIME_MS, "240000");
    }
    let config = FundlineConfig::load_from(&path).unwrap();
    assert_eq!(config.pipeline.run_timeout_ms, 900_000);
    assert_eq!(config.sla.max_total_time_ms, 240_000);

    unsafe {
        std::env::set_var(ENV_RUN_TIMEOUT_MS, "not-a-number");
    }
    assert!(FundlineConfig::load_from(&path).is_err());

    unsafe {
        std::env::remove_var(ENV_RUN_TIMEOUT_MS);
        std::env::remove_var(ENV_SLA_MAX_TOTAL_TIME_MS);
    }
}

// ============================================================================
// SECTION: Validation Limits
// ============================================================================

#[test]
fn out_of_range_values_are_rejected() {
    let mut config = FundlineConfig::default();
    config.pipeline.run_timeout_ms = 0;
    assert!(config.validate().is_err());

    let mut config = FundlineConfig::default();
    config.sla.min_success_rate_percentage = 150.0;
    assert!(config.validate().is_err());

    let mut config = FundlineConfig::default();
    config.server.similarity_threshold = 1.5;
    assert!(config.validate().is_err());

    let mut config = FundlineConfig::default();
    config.http.max_response_bytes = 0;
    assert!(config.validate().is_err());
}

#[test]
fn pipeline_config_projection_carries_the_targets() {
    let config = FundlineConfig::default();
    let pipeline = config.pipeline_config();
    assert_eq!(pipeline.run_timeout_ms, config.pipeline.run_timeout_ms);
    assert_eq!(
        pipeline.sla_targets.max_cost_per_opportunity_usd,
        config.sla.max_cost_per_opportunity_usd
    );
}
