// fundline-agents/tests/path_unit.rs
// ============================================================================
// Module: Dot-Path Unit Tests
// Description: Path resolution, amount parsing, and date parsing.
// Purpose: Pin the mapping DSL's fail-soft semantics.
// ============================================================================

//! Dot-path tests: nested objects, array indexing, text/amount coercions,
//! and the date formats the mapper accepts.

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

use fundline_agents::parse_amount;
use fundline_agents::parse_date;
use fundline_agents::resolve;
use fundline_agents::resolve_amount;
use fundline_agents::resolve_text;
use serde_json::json;

// ============================================================================
// SECTION: Resolution
// ============================================================================

#[test]
fn resolves_nested_objects_and_arrays() {
    let tree = json!({
        "data": { "items": [ { "id": "A1" }, { "id": "A2" } ] },
        "meta": { "next_cursor": "abc" }
    });
    assert_eq!(resolve(&tree, "data.items.1.id"), Some(&json!("A2")));
    assert_eq!(resolve_text(&tree, "meta.next_cursor"), Some("abc".to_string()));
    assert_eq!(resolve(&tree, "data.missing"), None);
    assert_eq!(resolve(&tree, "data.items.9"), None);
    assert_eq!(resolve(&tree, ""), Some(&tree));
}

#[test]
fn text_resolution_trims_and_rejects_containers() {
    let tree = json!({ "title": "  Solar Grant  ", "blank": "   ", "nested": {}, "n": 42 });
    assert_eq!(resolve_text(&tree, "title"), Some("Solar Grant".to_string()));
    assert_eq!(resolve_text(&tree, "blank"), None);
    assert_eq!(resolve_text(&tree, "nested"), None);
    assert_eq!(resolve_text(&tree, "n"), Some("42".to_string()));
}

// ============================================================================
// SECTION: Amounts
// ============================================================================

#[test]
fn amounts_parse_from_numbers_and_display_text() {
    let tree = json!({ "a": 1500.5, "b": "$1,500,000", "c": "-20", "d": "n/a" });
    assert_eq!(resolve_amount(&tree, "a"), Some(1500.5));
    assert_eq!(resolve_amount(&tree, "b"), Some(1_500_000.0));
    assert_eq!(resolve_amount(&tree, "c"), None);
    assert_eq!(resolve_amount(&tree, "d"), None);
    assert_eq!(parse_amount("  $2,500.75 "), Some(2500.75));
}

// ============================================================================
// SECTION: Dates
// ============================================================================

#[test]
fn dates_parse_rfc3339_and_date_only() {
    let full = parse_date("2026-03-01T12:30:00Z").unwrap();
    assert_eq!(full.to_iso8601(), "2026-03-01T12:30:00Z");
    let day = parse_date("2026-03-01").unwrap();
    assert_eq!(day.to_iso8601(), "2026-03-01T00:00:00Z");
    assert!(parse_date("March 1st").is_none());
}
