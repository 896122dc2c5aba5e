// fundline-core/src/core/identifiers.rs
// ============================================================================
// Module: Fundline Identifiers
// Description: Canonical identifiers for sources, runs, and opportunities.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde, uuid
// ============================================================================

//! ## Overview
//! This module defines the canonical identifiers used throughout Fundline.
//! Source, run, and opportunity identifiers are UUIDs validated at
//! construction boundaries; external record identifiers are opaque,
//! non-blank strings owned by the upstream API. The advisory-lock key used
//! to serialize runs per source is derived here so every component agrees on
//! the derivation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Identifier parse errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    /// Value is not a well-formed UUID.
    #[error("malformed uuid identifier: {0}")]
    MalformedUuid(String),
}

// ============================================================================
// SECTION: UUID Identifiers
// ============================================================================

/// Source identifier for a configured upstream API.
///
/// # Invariants
/// - Always a canonical lowercase hyphenated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Parses a source identifier from a UUID string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError::MalformedUuid`] when the value is not a UUID.
    pub fn parse(value: &str) -> Result<Self, IdentifierError> {
        canonical_uuid(value).map(Self)
    }

    /// Generates a fresh random source identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the 31-bit advisory-lock key for this source.
    ///
    /// The key is the first 8 hex characters of the UUID interpreted as an
    /// unsigned integer, reduced modulo 2^31 - 1. The result is always
    /// non-negative and stable across processes.
    #[must_use]
    pub fn lock_key(&self) -> i64 {
        let hex: String = self.0.chars().filter(char::is_ascii_hexdigit).take(8).collect();
        let raw = u64::from_str_radix(&hex, 16).unwrap_or(0);
        let reduced = raw % 2_147_483_647;
        // Representable in i64 because the modulus is below 2^31.
        i64::try_from(reduced).unwrap_or(0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Run identifier for one coordinator invocation.
///
/// # Invariants
/// - Always a canonical lowercase hyphenated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Parses a run identifier from a UUID string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError::MalformedUuid`] when the value is not a UUID.
    pub fn parse(value: &str) -> Result<Self, IdentifierError> {
        canonical_uuid(value).map(Self)
    }

    /// Generates a fresh random run identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Canonical opportunity identifier in the store.
///
/// # Invariants
/// - Always a canonical lowercase hyphenated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpportunityId(String);

impl OpportunityId {
    /// Parses an opportunity identifier from a UUID string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError::MalformedUuid`] when the value is not a UUID.
    pub fn parse(value: &str) -> Result<Self, IdentifierError> {
        canonical_uuid(value).map(Self)
    }

    /// Generates a fresh random opportunity identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Opaque Identifiers
// ============================================================================

/// Job identifier distinguishing parallel executions of one stage.
///
/// # Invariants
/// - Opaque UTF-8 string; no normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new job identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Normalizes a UUID string to its canonical lowercase hyphenated form.
fn canonical_uuid(value: &str) -> Result<String, IdentifierError> {
    Uuid::parse_str(value.trim())
        .map(|uuid| uuid.to_string())
        .map_err(|_| IdentifierError::MalformedUuid(value.to_string()))
}
