// fundline-config/src/config.rs
// ============================================================================
// Module: Fundline Configuration
// Description: Configuration loading and validation for the pipeline host.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: fundline-core, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size limits, then
//! overridden by the environment variables the core consumes
//! (`RUN_TIMEOUT_MS`, `COST_PER_TOKEN_USD`, `FRESHNESS_WINDOW_MS`, and the
//! `SLA_*` targets). Missing or invalid configuration fails closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use fundline_core::runtime::PipelineConfig;
use fundline_core::runtime::SlaTargets;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "fundline.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "FUNDLINE_CONFIG";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Environment variable overriding the per-run timeout.
pub const ENV_RUN_TIMEOUT_MS: &str = "RUN_TIMEOUT_MS";
/// Environment variable overriding the per-token cost.
pub const ENV_COST_PER_TOKEN_USD: &str = "COST_PER_TOKEN_USD";
/// Environment variable overriding the freshness window.
pub const ENV_FRESHNESS_WINDOW_MS: &str = "FRESHNESS_WINDOW_MS";
/// Environment variable overriding the SLA throughput target.
pub const ENV_SLA_MIN_OPPORTUNITIES_PER_MINUTE: &str = "SLA_MIN_OPPORTUNITIES_PER_MINUTE";
/// Environment variable overriding the SLA success-rate target.
pub const ENV_SLA_MIN_SUCCESS_RATE_PERCENTAGE: &str = "SLA_MIN_SUCCESS_RATE_PERCENTAGE";
/// Environment variable overriding the SLA cost target.
pub const ENV_SLA_MAX_COST_PER_OPPORTUNITY_USD: &str = "SLA_MAX_COST_PER_OPPORTUNITY_USD";
/// Environment variable overriding the SLA time target.
pub const ENV_SLA_MAX_TOTAL_TIME_MS: &str = "SLA_MAX_TOTAL_TIME_MS";
/// Minimum accepted run timeout in milliseconds.
pub(crate) const MIN_RUN_TIMEOUT_MS: u64 = 1_000;
/// Maximum accepted run timeout in milliseconds.
pub(crate) const MAX_RUN_TIMEOUT_MS: u64 = 86_400_000;
/// Maximum accepted freshness window in milliseconds.
pub(crate) const MAX_FRESHNESS_WINDOW_MS: u64 = 2_592_000_000;
/// Maximum accepted outbound response size in bytes.
pub(crate) const MAX_HTTP_RESPONSE_BYTES: usize = 32 * 1024 * 1024;
/// Default outbound request timeout in milliseconds.
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
/// Default outbound response cap in bytes.
const DEFAULT_HTTP_RESPONSE_BYTES: usize = 8 * 1024 * 1024;
/// Default admin bind address.
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
/// Default source-similarity threshold for the create guard.
const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// Config file exceeds the size cap.
    #[error("config file too large: {0} bytes")]
    TooLarge(usize),
    /// Config file failed to parse.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A field failed validation.
    #[error("config validation error: {0}")]
    Invalid(String),
    /// An environment override failed to parse.
    #[error("config environment override invalid: {0}")]
    Env(String),
}

// ============================================================================
// SECTION: Sections
// ============================================================================

/// Pipeline section of the host configuration.
///
/// # Invariants
/// - Values fall inside the documented limits after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Pipeline version tag.
    pub version: String,
    /// Per-run timeout in milliseconds.
    pub run_timeout_ms: u64,
    /// Estimated cost per LM token in USD.
    pub cost_per_token_usd: f64,
    /// Duplicate-detector freshness window in milliseconds.
    pub freshness_window_ms: u64,
    /// Whether the per-source circuit breaker guards stages.
    pub circuit_breaker_enabled: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            version: "v2".to_string(),
            run_timeout_ms: 1_800_000,
            cost_per_token_usd: 0.000_01,
            freshness_window_ms: 86_400_000,
            circuit_breaker_enabled: true,
        }
    }
}

/// SLA section of the host configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaSection {
    /// Minimum opportunities per minute.
    pub min_opportunities_per_minute: f64,
    /// Minimum success-rate percentage.
    pub min_success_rate_percentage: f64,
    /// Maximum cost per opportunity in USD.
    pub max_cost_per_opportunity_usd: f64,
    /// Maximum total run time in milliseconds.
    pub max_total_time_ms: u64,
}

impl Default for SlaSection {
    fn default() -> Self {
        let targets = SlaTargets::default();
        Self {
            min_opportunities_per_minute: targets.min_opportunities_per_minute,
            min_success_rate_percentage: targets.min_success_rate_percentage,
            max_cost_per_opportunity_usd: targets.max_cost_per_opportunity_usd,
            max_total_time_ms: targets.max_total_time_ms,
        }
    }
}

/// Admin server section of the host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Bind address for the admin surface.
    pub bind_addr: String,
    /// Source-similarity threshold for the create guard.
    pub similarity_threshold: f64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// Storage section of the host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// SQLite database path.
    pub path: PathBuf,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fundline.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Outbound HTTP section of the host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum response size in bytes.
    pub max_response_bytes: usize,
    /// User agent for outbound requests.
    pub user_agent: String,
    /// Allow cleartext HTTP upstreams.
    pub allow_http: bool,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            max_response_bytes: DEFAULT_HTTP_RESPONSE_BYTES,
            user_agent: "fundline/0.1".to_string(),
            allow_http: false,
        }
    }
}

// ============================================================================
// SECTION: Host Configuration
// ============================================================================

/// Complete host configuration for the pipeline, server, and worker.
///
/// # Invariants
/// - `validate` has passed before the configuration is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FundlineConfig {
    /// Pipeline settings.
    pub pipeline: PipelineSection,
    /// SLA targets.
    pub sla: SlaSection,
    /// Admin server settings.
    pub server: ServerSection,
    /// Storage settings.
    pub storage: StorageSection,
    /// Outbound HTTP settings.
    pub http: HttpSection,
}

impl FundlineConfig {
    /// Loads configuration from the default path or `FUNDLINE_CONFIG`,
    /// then applies environment overrides and validates.
    ///
    /// A missing file yields defaults plus overrides; an unreadable or
    /// invalid file fails closed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading, parsing, overriding, or
    /// validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_ENV_VAR).map_or_else(
            |_| PathBuf::from(DEFAULT_CONFIG_NAME),
            PathBuf::from,
        );
        Self::load_from(&path)
    }

    /// Loads configuration from an explicit path, applying environment
    /// overrides and validating.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading, parsing, overriding, or
    /// validation fails.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let metadata =
                fs::metadata(path).map_err(|err| ConfigError::Io(err.to_string()))?;
            let size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
            if size > MAX_CONFIG_FILE_SIZE {
                return Err(ConfigError::TooLarge(size));
            }
            let raw = fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
            toml::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the environment overrides the core consumes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] when an override fails to parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env_u64(ENV_RUN_TIMEOUT_MS)? {
            self.pipeline.run_timeout_ms = value;
        }
        if let Some(value) = read_env_f64(ENV_COST_PER_TOKEN_USD)? {
            self.pipeline.cost_per_token_usd = value;
        }
        if let Some(value) = read_env_u64(ENV_FRESHNESS_WINDOW_MS)? {
            self.pipeline.freshness_window_ms = value;
        }
        if let Some(value) = read_env_f64(ENV_SLA_MIN_OPPORTUNITIES_PER_MINUTE)? {
            self.sla.min_opportunities_per_minute = value;
        }
        if let Some(value) = read_env_f64(ENV_SLA_MIN_SUCCESS_RATE_PERCENTAGE)? {
            self.sla.min_success_rate_percentage = value;
        }
        if let Some(value) = read_env_f64(ENV_SLA_MAX_COST_PER_OPPORTUNITY_USD)? {
            self.sla.max_cost_per_opportunity_usd = value;
        }
        if let Some(value) = read_env_u64(ENV_SLA_MAX_TOTAL_TIME_MS)? {
            self.sla.max_total_time_ms = value;
        }
        Ok(())
    }

    /// Validates the configuration against hard limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on the first violated limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.version.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline.version must be non-empty".to_string()));
        }
        if !(MIN_RUN_TIMEOUT_MS..=MAX_RUN_TIMEOUT_MS).contains(&self.pipeline.run_timeout_ms) {
            return Err(ConfigError::Invalid(format!(
                "pipeline.run_timeout_ms must be within [{MIN_RUN_TIMEOUT_MS}, {MAX_RUN_TIMEOUT_MS}]"
            )));
        }
        if self.pipeline.cost_per_token_usd < 0.0 {
            return Err(ConfigError::Invalid(
                "pipeline.cost_per_token_usd must be non-negative".to_string(),
            ));
        }
        if self.pipeline.freshness_window_ms > MAX_FRESHNESS_WINDOW_MS {
            return Err(ConfigError::Invalid(format!(
                "pipeline.freshness_window_ms must not exceed {MAX_FRESHNESS_WINDOW_MS}"
            )));
        }
        if self.sla.min_opportunities_per_minute <= 0.0 {
            return Err(ConfigError::Invalid(
                "sla.min_opportunities_per_minute must be positive".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.sla.min_success_rate_percentage) {
            return Err(ConfigError::Invalid(
                "sla.min_success_rate_percentage must be within [0, 100]".to_string(),
            ));
        }
        if self.sla.max_cost_per_opportunity_usd <= 0.0 {
            return Err(ConfigError::Invalid(
                "sla.max_cost_per_opportunity_usd must be positive".to_string(),
            ));
        }
        if self.sla.max_total_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "sla.max_total_time_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.server.similarity_threshold) {
            return Err(ConfigError::Invalid(
                "server.similarity_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.server.bind_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind_addr must be non-empty".to_string()));
        }
        if self.http.timeout_ms == 0 {
            return Err(ConfigError::Invalid("http.timeout_ms must be positive".to_string()));
        }
        if self.http.max_response_bytes == 0
            || self.http.max_response_bytes > MAX_HTTP_RESPONSE_BYTES
        {
            return Err(ConfigError::Invalid(format!(
                "http.max_response_bytes must be within [1, {MAX_HTTP_RESPONSE_BYTES}]"
            )));
        }
        Ok(())
    }

    /// Builds the core pipeline configuration from this host configuration.
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            pipeline_version: self.pipeline.version.clone(),
            run_timeout_ms: self.pipeline.run_timeout_ms,
            cost_per_token_usd: self.pipeline.cost_per_token_usd,
            freshness_window_ms: self.pipeline.freshness_window_ms,
            sla_targets: self.sla_targets(),
            circuit_breaker_enabled: self.pipeline.circuit_breaker_enabled,
        }
    }

    /// Builds the SLA targets from this host configuration.
    #[must_use]
    pub const fn sla_targets(&self) -> SlaTargets {
        SlaTargets {
            min_opportunities_per_minute: self.sla.min_opportunities_per_minute,
            min_success_rate_percentage: self.sla.min_success_rate_percentage,
            max_cost_per_opportunity_usd: self.sla.max_cost_per_opportunity_usd,
            max_total_time_ms: self.sla.max_total_time_ms,
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Reads an optional u64 environment override.
fn read_env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Env(format!("{name} must be an unsigned integer"))),
        Err(_) => Ok(None),
    }
}

/// Reads an optional f64 environment override.
fn read_env_f64(name: &str) -> Result<Option<f64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ConfigError::Env(format!("{name} must be a number"))),
        Err(_) => Ok(None),
    }
}
