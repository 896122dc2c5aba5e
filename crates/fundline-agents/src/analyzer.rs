// fundline-agents/src/analyzer.rs
// ============================================================================
// Module: Source Analyzer
// Description: Pre-extraction analysis of a configured source.
// Purpose: Select the effective endpoint and workflow, optionally LM-assisted.
// Dependencies: fundline-core, url
// ============================================================================

//! ## Overview
//! Analysis inspects the source row and configuration bundle, picks the
//! endpoint the extractor should call, and selects the single-pass or
//! two-step workflow. When a language model is wired, it reviews the choice
//! and contributes a confidence estimate; without one, confidence comes
//! from configuration completeness alone. The analyzer never mutates the
//! source.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::interfaces::AnalyzerError;
use fundline_core::interfaces::LanguageModel;
use fundline_core::interfaces::LmRequest;
use fundline_core::interfaces::SourceAnalysis;
use fundline_core::interfaces::SourceAnalyzer;
use fundline_core::interfaces::WorkflowKind;
use url::Url;

// ============================================================================
// SECTION: Analyzer
// ============================================================================

/// Confidence for a fully mapped configuration.
const CONFIDENCE_MAPPED: f64 = 0.9;
/// Confidence when no response mapping exists.
const CONFIDENCE_UNMAPPED: f64 = 0.6;
/// Token cap for the optional LM review.
const REVIEW_MAX_TOKENS: u32 = 256;

/// Source analyzer over the configuration bundle, optionally LM-assisted.
pub struct ConfiguredSourceAnalyzer {
    /// Optional language model for endpoint review.
    lm: Option<Arc<dyn LanguageModel>>,
}

impl ConfiguredSourceAnalyzer {
    /// Creates an analyzer without LM assistance.
    #[must_use]
    pub const fn heuristic() -> Self {
        Self {
            lm: None,
        }
    }

    /// Creates an analyzer that reviews its choice with a language model.
    #[must_use]
    pub const fn with_model(lm: Arc<dyn LanguageModel>) -> Self {
        Self {
            lm: Some(lm),
        }
    }
}

impl SourceAnalyzer for ConfiguredSourceAnalyzer {
    fn analyze(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
    ) -> Result<SourceAnalysis, AnalyzerError> {
        let started = Instant::now();
        let endpoint = effective_endpoint(source)?;
        let workflow = if configuration.detail.is_some() {
            WorkflowKind::TwoStep
        } else {
            WorkflowKind::SinglePass
        };
        let mut confidence = if configuration.response_mapping.fields.is_empty() {
            CONFIDENCE_UNMAPPED
        } else {
            CONFIDENCE_MAPPED
        };
        let mut token_usage = 0;
        let mut api_calls = 0;

        if let Some(lm) = &self.lm {
            let request = LmRequest {
                system: "You review funding-source API configurations.".to_string(),
                prompt: format!(
                    "Endpoint: {endpoint}\nWorkflow: {workflow:?}\nMapped fields: {}\n\
                     Reply with a confidence between 0 and 1 that this configuration \
                     will extract funding opportunities.",
                    configuration.response_mapping.fields.len()
                ),
                max_tokens: REVIEW_MAX_TOKENS,
            };
            let response =
                lm.complete(&request).map_err(|err| AnalyzerError::Model(err.to_string()))?;
            token_usage = response.tokens_used;
            api_calls = 1;
            if let Ok(reviewed) = response.content.trim().parse::<f64>()
                && (0.0..=1.0).contains(&reviewed)
            {
                confidence = reviewed;
            }
        }

        Ok(SourceAnalysis {
            endpoint: endpoint.to_string(),
            workflow,
            confidence,
            token_usage,
            api_calls,
            execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Picks the effective endpoint: explicit API endpoint, else the base URL.
fn effective_endpoint(source: &Source) -> Result<Url, AnalyzerError> {
    let candidate = source
        .api_endpoint
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(source.url.trim());
    if let Ok(absolute) = Url::parse(candidate) {
        return Ok(absolute);
    }
    let base = Url::parse(source.url.trim()).map_err(|_| {
        AnalyzerError::Invalid(format!("source base url is not absolute: {}", source.url))
    })?;
    base.join(candidate)
        .map_err(|_| AnalyzerError::Invalid(format!("api endpoint does not resolve: {candidate}")))
}
