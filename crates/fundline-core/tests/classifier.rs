// fundline-core/tests/classifier.rs
// ============================================================================
// Module: Error Classifier Unit Tests
// Description: Category heuristics and retryability decisions.
// Purpose: Pin the six-category taxonomy and its precedence order.
// ============================================================================

//! Classifier tests covering marker precedence, status-code retryability,
//! and the timeout constructor.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use fundline_core::AttemptFailure;
use fundline_core::ErrorCategory;
use fundline_core::StageName;
use fundline_core::classify;
use fundline_core::timeout_error;

// ============================================================================
// SECTION: Category Heuristics
// ============================================================================

#[test]
fn validation_markers_classify_non_retryable() {
    for message in ["validation failed", "missing content in reply", "missing scoring block"] {
        let classified =
            classify(StageName::Analysis, &AttemptFailure::message(message));
        assert_eq!(classified.category, ErrorCategory::ValidationError, "{message}");
        assert!(!classified.retryable, "{message}");
    }
}

#[test]
fn api_markers_classify_as_api_error() {
    for message in ["api unreachable", "network reset", "fetch aborted", "http layer failure"] {
        let classified =
            classify(StageName::DataExtraction, &AttemptFailure::message(message));
        assert_eq!(classified.category, ErrorCategory::ApiError, "{message}");
    }
}

#[test]
fn timeout_markers_are_retryable() {
    for message in ["operation timeout", "request timed out"] {
        let classified = classify(StageName::Storage, &AttemptFailure::message(message));
        assert_eq!(classified.category, ErrorCategory::TimeoutError, "{message}");
        assert!(classified.retryable, "{message}");
    }
}

#[test]
fn duplicate_and_storage_markers() {
    let duplicate =
        classify(StageName::Storage, &AttemptFailure::message("row rejected as duplicate"));
    assert_eq!(duplicate.category, ErrorCategory::DuplicateRejection);
    assert!(!duplicate.retryable);

    let storage =
        classify(StageName::Storage, &AttemptFailure::message("database constraint violated"));
    assert_eq!(storage.category, ErrorCategory::StorageError);
    assert!(!storage.retryable);

    let transient =
        classify(StageName::Storage, &AttemptFailure::message("database is busy, locked"));
    assert_eq!(transient.category, ErrorCategory::StorageError);
    assert!(transient.retryable);
}

#[test]
fn unmatched_messages_default_to_processing() {
    let classified = classify(StageName::Filter, &AttemptFailure::message("something odd"));
    assert_eq!(classified.category, ErrorCategory::ProcessingError);
    assert!(!classified.retryable);
}

#[test]
fn validation_wins_over_api_markers() {
    let classified = classify(
        StageName::DataExtraction,
        &AttemptFailure::message("api response failed validation"),
    );
    assert_eq!(classified.category, ErrorCategory::ValidationError);
    assert!(!classified.retryable);
}

// ============================================================================
// SECTION: Status Codes
// ============================================================================

#[test]
fn api_retryability_follows_status_codes() {
    let retryable = [408_u16, 425, 429, 500, 502, 599];
    for status in retryable {
        let classified = classify(
            StageName::DataExtraction,
            &AttemptFailure::http("api fetch failed", status),
        );
        assert!(classified.retryable, "status {status} should retry");
    }
    let fatal = [400_u16, 401, 403, 404, 410, 422];
    for status in fatal {
        let classified = classify(
            StageName::DataExtraction,
            &AttemptFailure::http("api fetch failed", status),
        );
        assert!(!classified.retryable, "status {status} should not retry");
    }
}

#[test]
fn api_without_status_is_retryable() {
    let classified =
        classify(StageName::DataExtraction, &AttemptFailure::message("network flake"));
    assert!(classified.retryable);
}

// ============================================================================
// SECTION: Timeout Constructor
// ============================================================================

#[test]
fn timeout_constructor_is_terminal() {
    let classified = timeout_error(StageName::Analysis, "run exceeded its time budget");
    assert_eq!(classified.category, ErrorCategory::TimeoutError);
    assert!(!classified.retryable);
    assert_eq!(classified.stage, StageName::Analysis);
}

#[test]
fn classifier_is_pure() {
    let failure = AttemptFailure::http("api fetch failed", 503);
    let first = classify(StageName::DataExtraction, &failure);
    let second = classify(StageName::DataExtraction, &failure);
    assert_eq!(first, second);
}
