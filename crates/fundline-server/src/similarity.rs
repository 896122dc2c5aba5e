// fundline-server/src/similarity.rs
// ============================================================================
// Module: Source Similarity
// Description: Token-cosine similarity over source identity text.
// Purpose: Guard source creation against near-duplicate registrations.
// Dependencies: none beyond std
// ============================================================================

//! ## Overview
//! Source creation is rejected when the new source's name and organization
//! are too similar to an existing source. Similarity is the cosine of the
//! two lowercased token multisets; the threshold is configurable and
//! defaults to 0.85.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

// ============================================================================
// SECTION: Similarity
// ============================================================================

/// Cosine similarity of two identity strings' token multisets, in [0, 1].
#[must_use]
pub fn identity_similarity(left: &str, right: &str) -> f64 {
    let left_counts = token_counts(left);
    let right_counts = token_counts(right);
    if left_counts.is_empty() || right_counts.is_empty() {
        return 0.0;
    }
    let dot: f64 = left_counts
        .iter()
        .filter_map(|(token, count)| {
            right_counts.get(token).map(|other| to_f64(*count) * to_f64(*other))
        })
        .sum();
    let left_norm = norm(&left_counts);
    let right_norm = norm(&right_counts);
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    (dot / (left_norm * right_norm)).clamp(0.0, 1.0)
}

/// Builds the combined identity text for a source.
#[must_use]
pub fn identity_text(name: &str, organization: &str) -> String {
    format!("{name} {organization}")
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Counts lowercased alphanumeric tokens.
fn token_counts(text: &str) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for token in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
    {
        *counts.entry(token.to_ascii_lowercase()).or_insert(0) += 1;
    }
    counts
}

/// Euclidean norm of a token-count vector.
fn norm(counts: &BTreeMap<String, u64>) -> f64 {
    counts.values().map(|count| to_f64(*count) * to_f64(*count)).sum::<f64>().sqrt()
}

/// Converts a token count to f64.
#[allow(clippy::cast_precision_loss, reason = "Token counts stay far below 2^52.")]
const fn to_f64(value: u64) -> f64 {
    value as f64
}
