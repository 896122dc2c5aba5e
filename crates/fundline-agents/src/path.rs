// fundline-agents/src/path.rs
// ============================================================================
// Module: Dot-Path Evaluation
// Description: Minimal dot-path DSL over JSON trees.
// Purpose: Resolve response-mapping and cursor paths without dynamic traversal.
// Dependencies: serde_json
// ============================================================================

//! ## Overview
//! Response mappings, cursor locations, and detail identifiers are all
//! expressed as dot paths (`data.items`, `meta.next_cursor`). Evaluation
//! walks object keys segment by segment; a numeric segment indexes into an
//! array. Anything unresolvable yields `None` rather than an error so the
//! mapper can fail soft per field.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_json::Value;

// ============================================================================
// SECTION: Evaluation
// ============================================================================

/// Resolves a dot path against a JSON tree.
///
/// Numeric segments index arrays; all other segments are object keys. An
/// empty path resolves to the root.
#[must_use]
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in trimmed.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Resolves a dot path to a non-blank string.
///
/// Numbers render with their JSON representation; objects, arrays, and
/// nulls yield `None`.
#[must_use]
pub fn resolve_text(root: &Value, path: &str) -> Option<String> {
    match resolve(root, path)? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}

/// Resolves a dot path to a parsed amount.
///
/// Strings are parsed after stripping currency symbols, commas, and
/// whitespace; negative and non-numeric values yield `None`.
#[must_use]
pub fn resolve_amount(root: &Value, path: &str) -> Option<f64> {
    match resolve(root, path)? {
        Value::Number(number) => number.as_f64().filter(|value| *value >= 0.0),
        Value::String(text) => parse_amount(text),
        _ => None,
    }
}

/// Parses a monetary amount from display text.
#[must_use]
pub fn parse_amount(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse::<f64>().ok().filter(|value| *value >= 0.0)
}
