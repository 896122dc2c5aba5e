// fundline-config/src/lib.rs
// ============================================================================
// Module: Fundline Config Library
// Description: Host configuration and source-body validation.
// Purpose: Expose fail-closed configuration loading for every Fundline host.
// Dependencies: fundline-core, serde, toml, url
// ============================================================================

//! ## Overview
//! This crate loads the host configuration (TOML plus the environment
//! overrides the core consumes) and validates admin-submitted source bodies
//! before they reach the datastore.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod source_rules;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::CONFIG_ENV_VAR;
pub use config::ConfigError;
pub use config::ENV_COST_PER_TOKEN_USD;
pub use config::ENV_FRESHNESS_WINDOW_MS;
pub use config::ENV_RUN_TIMEOUT_MS;
pub use config::ENV_SLA_MAX_COST_PER_OPPORTUNITY_USD;
pub use config::ENV_SLA_MAX_TOTAL_TIME_MS;
pub use config::ENV_SLA_MIN_OPPORTUNITIES_PER_MINUTE;
pub use config::ENV_SLA_MIN_SUCCESS_RATE_PERCENTAGE;
pub use config::FundlineConfig;
pub use config::HttpSection;
pub use config::PipelineSection;
pub use config::ServerSection;
pub use config::SlaSection;
pub use config::StorageSection;
pub use source_rules::SourceRuleError;
pub use source_rules::is_dot_path;
pub use source_rules::validate_auth;
pub use source_rules::validate_configuration;
pub use source_rules::validate_detail;
pub use source_rules::validate_pagination;
pub use source_rules::validate_row;
pub use source_rules::validate_source;
