// fundline-core/src/core/time.rs
// ============================================================================
// Module: Fundline Time Model
// Description: Canonical timestamps and the clock abstraction.
// Purpose: Provide deterministic, replayable time values across Fundline records.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! All persisted time fields are unix-epoch milliseconds that serialize as
//! ISO-8601 UTC strings. The runtime never reads wall-clock time directly;
//! components receive a [`Clock`] so tests can inject a manual clock and
//! replay runs deterministically.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::Error as DeError;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// Canonical timestamp in unix-epoch milliseconds.
///
/// # Invariants
/// - Serializes as an ISO-8601 UTC string on every wire and storage surface.
/// - Ordering follows the underlying millisecond value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from unix-epoch milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as unix-epoch milliseconds.
    #[must_use]
    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    /// Returns this timestamp advanced by the given milliseconds, saturating.
    #[must_use]
    pub const fn saturating_add_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Returns the elapsed milliseconds since `earlier`, clamped to zero.
    #[must_use]
    pub const fn millis_since(self, earlier: Self) -> u64 {
        let delta = self.0.saturating_sub(earlier.0);
        if delta < 0 { 0 } else { delta as u64 }
    }

    /// Renders the timestamp as an ISO-8601 UTC string.
    #[must_use]
    pub fn to_iso8601(self) -> String {
        let nanos = i128::from(self.0).saturating_mul(1_000_000);
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()
            .and_then(|value| value.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.0.to_string())
    }

    /// Parses a timestamp from an ISO-8601 UTC string.
    ///
    /// # Errors
    ///
    /// Returns a formatted message when the value is not ISO-8601.
    pub fn parse_iso8601(value: &str) -> Result<Self, String> {
        let parsed = OffsetDateTime::parse(value.trim(), &Rfc3339)
            .map_err(|_| format!("invalid iso-8601 timestamp: {value}"))?;
        let millis = parsed.unix_timestamp_nanos() / 1_000_000;
        i64::try_from(millis)
            .map(Self)
            .map_err(|_| format!("timestamp out of range: {value}"))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_iso8601().fmt(f)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso8601())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse_iso8601(&raw).map_err(DeError::custom)
    }
}

// ============================================================================
// SECTION: Clock Abstraction
// ============================================================================

/// Wall-clock source for runtime components.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// System clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let millis = nanos / 1_000_000;
        Timestamp(i64::try_from(millis).unwrap_or(i64::MAX))
    }
}

/// Manually advanced clock for tests and replay.
///
/// # Invariants
/// - `now` never moves backwards through this type's methods.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    /// Current time in unix-epoch milliseconds, guarded for shared use.
    now_millis: Arc<Mutex<i64>>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given timestamp.
    #[must_use]
    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            now_millis: Arc::new(Mutex::new(start.as_unix_millis())),
        }
    }

    /// Advances the clock by the given milliseconds.
    pub fn advance_millis(&self, millis: i64) {
        if let Ok(mut guard) = self.now_millis.lock() {
            *guard = guard.saturating_add(millis.max(0));
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now_millis.lock().map_or(Timestamp(0), |guard| Timestamp(*guard))
    }
}
