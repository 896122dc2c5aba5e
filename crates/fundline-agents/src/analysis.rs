// fundline-agents/src/analysis.rs
// ============================================================================
// Module: LM Analysis Agent
// Description: Scoring and categorization of new opportunities.
// Purpose: Enrich NEW records with model output, preserving batch order.
// Dependencies: fundline-core, serde_json
// ============================================================================

//! ## Overview
//! The analysis agent sends one completion per record and expects a JSON
//! object with a relevance score, categories, and a summary. Output order
//! matches input order. Missing or unparsable scoring fails the batch so
//! the retrier can classify it as a validation failure.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use fundline_core::ExtractedOpportunity;
use fundline_core::OpportunityAnalysis;
use fundline_core::Source;
use fundline_core::interfaces::AnalysisAgent;
use fundline_core::interfaces::AnalysisError;
use fundline_core::interfaces::AnalysisOutput;
use fundline_core::interfaces::AnalyzedOpportunity;
use fundline_core::interfaces::LanguageModel;
use fundline_core::interfaces::LmRequest;
use serde_json::Value;

// ============================================================================
// SECTION: Analysis Agent
// ============================================================================

/// Token cap for one record analysis.
const ANALYSIS_MAX_TOKENS: u32 = 1_024;

/// LM-backed analysis agent.
pub struct LmAnalysisAgent {
    /// Language model client.
    lm: Arc<dyn LanguageModel>,
    /// Model tag stamped on produced analyses.
    model_tag: String,
}

impl LmAnalysisAgent {
    /// Creates an analysis agent over the given model client.
    #[must_use]
    pub fn new(lm: Arc<dyn LanguageModel>, model_tag: impl Into<String>) -> Self {
        Self {
            lm,
            model_tag: model_tag.into(),
        }
    }
}

impl AnalysisAgent for LmAnalysisAgent {
    fn enhance(
        &self,
        new_opportunities: &[ExtractedOpportunity],
        source: &Source,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let started = Instant::now();
        let mut output = AnalysisOutput::default();
        for record in new_opportunities {
            let request = LmRequest {
                system: "You score funding opportunities for relevance. Reply with a JSON \
                         object: {\"relevance_score\": <0-10>, \"categories\": [..], \
                         \"summary\": \"..\"}."
                    .to_string(),
                prompt: format!(
                    "Source: {} ({})\nTitle: {}\nDescription: {}\nAgency: {}",
                    source.name,
                    source.organization,
                    record.title.as_deref().unwrap_or(""),
                    record.description.as_deref().unwrap_or(""),
                    record.agency.as_deref().unwrap_or(""),
                ),
                max_tokens: ANALYSIS_MAX_TOKENS,
            };
            let response =
                self.lm.complete(&request).map_err(|err| AnalysisError::Model(err.to_string()))?;
            output.metrics.total_api_calls += 1;
            output.metrics.total_tokens += response.tokens_used;
            let analysis = parse_analysis(&response.content, &self.model_tag, response.tokens_used)
                .ok_or_else(|| {
                    AnalysisError::MissingScoring(
                        record.trimmed_api_id().unwrap_or("<no id>").to_string(),
                    )
                })?;
            output.opportunities.push(AnalyzedOpportunity {
                record: record.clone(),
                analysis,
            });
        }
        output.metrics.total_execution_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(output)
    }
}

// ============================================================================
// SECTION: Heuristic Agent
// ============================================================================

/// Offline analysis agent scoring records by field completeness.
///
/// Used when no language model is wired: scores are deterministic, tokens
/// are zero, and the batch never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAnalysisAgent;

impl AnalysisAgent for HeuristicAnalysisAgent {
    fn enhance(
        &self,
        new_opportunities: &[ExtractedOpportunity],
        _source: &Source,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let started = Instant::now();
        let mut output = AnalysisOutput::default();
        for record in new_opportunities {
            output.opportunities.push(AnalyzedOpportunity {
                record: record.clone(),
                analysis: OpportunityAnalysis {
                    relevance_score: completeness_score(record),
                    categories: record.funding_type.iter().cloned().collect(),
                    summary: record
                        .description
                        .as_deref()
                        .unwrap_or_default()
                        .chars()
                        .take(280)
                        .collect(),
                    model: "heuristic".to_string(),
                    tokens_used: 0,
                },
            });
        }
        output.metrics.total_execution_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(output)
    }
}

/// Scores a record in [0, 10] by populated-field count.
fn completeness_score(record: &ExtractedOpportunity) -> f64 {
    let populated = [
        record.trimmed_title().is_some(),
        record.description.is_some(),
        record.agency.is_some(),
        record.total_funding.is_some(),
        record.min_award.is_some(),
        record.max_award.is_some(),
        record.open_date.is_some(),
        record.close_date.is_some(),
        record.eligibility.is_some(),
        record.url.is_some(),
    ]
    .into_iter()
    .filter(|flag| *flag)
    .count();
    f64::from(u8::try_from(populated).unwrap_or(10))
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Parses the model's JSON reply into analysis fields.
fn parse_analysis(content: &str, model_tag: &str, tokens_used: u64) -> Option<OpportunityAnalysis> {
    let value: Value = serde_json::from_str(content.trim()).ok()?;
    let relevance_score = value.get("relevance_score")?.as_f64()?;
    if !(0.0..=10.0).contains(&relevance_score) {
        return None;
    }
    let categories = value
        .get("categories")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<String>>()
        })
        .unwrap_or_default();
    let summary = value.get("summary").and_then(Value::as_str).unwrap_or("").to_string();
    Some(OpportunityAnalysis {
        relevance_score,
        categories,
        summary,
        model: model_tag.to_string(),
        tokens_used,
    })
}
