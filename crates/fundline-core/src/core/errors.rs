// fundline-core/src/core/errors.rs
// ============================================================================
// Module: Fundline Error Taxonomy
// Description: Stage-failure categories and the pure error classifier.
// Purpose: Tag failures with a stable category and retryability for the retrier
//          and failure-breakdown counters.
// Dependencies: crate::core::run, serde, thiserror
// ============================================================================

//! ## Overview
//! Every stage failure is classified into one of six stable categories by
//! inspecting the failure message and, for API failures, the HTTP status
//! code. Classification is a pure function: the same inputs always produce
//! the same category and retryability, which keeps retry behavior replayable.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::run::StageName;

// ============================================================================
// SECTION: Categories
// ============================================================================

/// Stable failure categories for stage errors.
///
/// # Invariants
/// - Wire forms are SCREAMING_SNAKE_CASE and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Input or contract validation failed.
    ValidationError,
    /// Upstream API or network failure.
    ApiError,
    /// Operation exceeded its time budget.
    TimeoutError,
    /// Store rejected a duplicate row.
    DuplicateRejection,
    /// Datastore failure.
    StorageError,
    /// Uncategorized processing failure.
    ProcessingError,
}

impl ErrorCategory {
    /// Returns the stable wire form of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ApiError => "API_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::DuplicateRejection => "DUPLICATE_REJECTION",
            Self::StorageError => "STORAGE_ERROR",
            Self::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Attempt Failures
// ============================================================================

/// Raw failure raised by one stage attempt, before classification.
///
/// # Invariants
/// - `message` is human-readable and safe to persist.
/// - `status_code` is present only for HTTP-shaped failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AttemptFailure {
    /// Failure message, including any cause chain text.
    pub message: String,
    /// HTTP status code, when the failure came from an HTTP response.
    pub status_code: Option<u16>,
}

impl AttemptFailure {
    /// Creates an attempt failure from a message.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    /// Creates an attempt failure from a message and HTTP status.
    #[must_use]
    pub fn http(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }
}

// ============================================================================
// SECTION: Classified Errors
// ============================================================================

/// A stage failure tagged with category and retryability.
///
/// # Invariants
/// - `retryable` follows the category heuristics in [`classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{category} in {stage}: {user_message}")]
pub struct ClassifiedError {
    /// Failure category.
    pub category: ErrorCategory,
    /// Whether the retrier may attempt again.
    pub retryable: bool,
    /// Operator-facing message.
    pub user_message: String,
    /// Original failure message.
    pub original_message: String,
    /// Stage that raised the failure.
    pub stage: StageName,
    /// HTTP status code, when available.
    pub status_code: Option<u16>,
}

// ============================================================================
// SECTION: Classifier
// ============================================================================

/// Message fragments that indicate a validation failure.
const VALIDATION_MARKERS: [&str; 3] = ["validation", "missing content", "missing scoring"];
/// Message fragments that indicate an API or network failure.
const API_MARKERS: [&str; 4] = ["api", "network", "fetch", "http"];
/// Message fragments that indicate a timeout.
const TIMEOUT_MARKERS: [&str; 2] = ["timeout", "timed out"];
/// Message fragments that indicate a duplicate rejection.
const DUPLICATE_MARKERS: [&str; 1] = ["duplicate"];
/// Message fragments that indicate a storage failure.
const STORAGE_MARKERS: [&str; 3] = ["storage", "database", "constraint"];
/// Storage fragments that indicate a transient storage failure.
const TRANSIENT_STORAGE_MARKERS: [&str; 4] = ["busy", "locked", "unavailable", "connection"];

/// Classifies a stage failure into a category with retryability.
///
/// Categories are tested in a fixed order: validation, API, timeout,
/// duplicate, storage, then the processing default. API failures are
/// retryable when no status code is present or the status is 408, 425, 429,
/// or any 5xx. Storage failures are retryable only for transient markers.
#[must_use]
pub fn classify(stage: StageName, failure: &AttemptFailure) -> ClassifiedError {
    let haystack = failure.message.to_lowercase();
    let (category, retryable) = if contains_any(&haystack, &VALIDATION_MARKERS) {
        (ErrorCategory::ValidationError, false)
    } else if contains_any(&haystack, &API_MARKERS) {
        (ErrorCategory::ApiError, api_retryable(failure.status_code))
    } else if contains_any(&haystack, &TIMEOUT_MARKERS) {
        (ErrorCategory::TimeoutError, true)
    } else if contains_any(&haystack, &DUPLICATE_MARKERS) {
        (ErrorCategory::DuplicateRejection, false)
    } else if contains_any(&haystack, &STORAGE_MARKERS) {
        (ErrorCategory::StorageError, contains_any(&haystack, &TRANSIENT_STORAGE_MARKERS))
    } else {
        (ErrorCategory::ProcessingError, false)
    };
    ClassifiedError {
        category,
        retryable,
        user_message: user_message(category, stage),
        original_message: failure.message.clone(),
        stage,
        status_code: failure.status_code,
    }
}

/// Builds a timeout classification for runs that exceeded their budget.
#[must_use]
pub fn timeout_error(stage: StageName, message: impl Into<String>) -> ClassifiedError {
    ClassifiedError {
        category: ErrorCategory::TimeoutError,
        retryable: false,
        user_message: user_message(ErrorCategory::TimeoutError, stage),
        original_message: message.into(),
        stage,
        status_code: None,
    }
}

/// Returns whether an API status code is worth retrying.
const fn api_retryable(status_code: Option<u16>) -> bool {
    match status_code {
        None => true,
        Some(code) => matches!(code, 408 | 425 | 429 | 500..=599),
    }
}

/// Returns true when any marker occurs in the lowercased haystack.
fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| haystack.contains(marker))
}

/// Builds the operator-facing message for a category and stage.
fn user_message(category: ErrorCategory, stage: StageName) -> String {
    let summary = match category {
        ErrorCategory::ValidationError => "input failed validation",
        ErrorCategory::ApiError => "upstream API request failed",
        ErrorCategory::TimeoutError => "operation timed out",
        ErrorCategory::DuplicateRejection => "record rejected as duplicate",
        ErrorCategory::StorageError => "datastore operation failed",
        ErrorCategory::ProcessingError => "processing failed",
    };
    format!("{summary} during {}", stage.as_str())
}
