// fundline-core/src/runtime/retry.rs
// ============================================================================
// Module: Fundline Retrier and Circuit Breaker
// Description: Bounded retries with backoff, plus a per-key circuit breaker.
// Purpose: Execute stage attempts with classified failures and replayable delays.
// Dependencies: crate::core::{errors, run, time}
// ============================================================================

//! ## Overview
//! The retrier executes one stage attempt function under a policy: bounded
//! attempts, exponential backoff doubled per attempt, and a deterministic
//! ±20% jitter derived from the stage and attempt number so replays observe
//! identical delays. Failures are classified before every retry decision;
//! non-retryable failures short-circuit. The circuit breaker wraps a
//! source+stage key and opens after five consecutive failures, half-opening
//! after a cooldown.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::core::errors::AttemptFailure;
use crate::core::errors::ClassifiedError;
use crate::core::errors::classify;
use crate::core::errors::timeout_error;
use crate::core::run::StageName;
use crate::core::time::Clock;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Policies
// ============================================================================

/// Retry policy bounding attempts and delays.
///
/// # Invariants
/// - `max_attempts >= 1`; delays are clamped to `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Whether ±20% jitter is applied.
    pub jitter: bool,
}

/// Conservative policy for cheap, rarely flaky stages.
pub const CONSERVATIVE: RetryPolicy = RetryPolicy {
    max_attempts: 2,
    base_delay_ms: 500,
    max_delay_ms: 2_000,
    jitter: true,
};

/// Default policy for ordinary stages.
pub const DEFAULT: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    base_delay_ms: 1_000,
    max_delay_ms: 10_000,
    jitter: true,
};

/// Aggressive policy for stages worth fighting for.
pub const AGGRESSIVE: RetryPolicy = RetryPolicy {
    max_attempts: 5,
    base_delay_ms: 500,
    max_delay_ms: 30_000,
    jitter: true,
};

// ============================================================================
// SECTION: Waiting
// ============================================================================

/// Delay primitive between attempts.
pub trait Waiter: Send + Sync {
    /// Waits for the given milliseconds.
    fn wait(&self, delay_ms: u64);
}

/// Waiter backed by thread sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadWaiter;

impl Waiter for ThreadWaiter {
    fn wait(&self, delay_ms: u64) {
        thread::sleep(Duration::from_millis(delay_ms));
    }
}

/// Waiter that returns immediately, for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWaiter;

impl Waiter for NoWaiter {
    fn wait(&self, _delay_ms: u64) {}
}

// ============================================================================
// SECTION: Retry Bookkeeping
// ============================================================================

/// Sink for retry bookkeeping events.
pub trait RetrySink {
    /// Records a retry decision before the wait.
    fn on_retry(&self, stage: StageName, attempt: u32, delay_ms: u64, reason: &str);

    /// Records the terminal failure of a stage attempt loop.
    fn on_exhausted(
        &self,
        stage: StageName,
        attempt: u32,
        classified: &ClassifiedError,
        elapsed_ms: u64,
    );

    /// Records an eventual success after at least one retry.
    fn on_recovery(&self, stage: StageName, attempts: u32);
}

/// Sink that drops all events, for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRetrySink;

impl RetrySink for NoopRetrySink {
    fn on_retry(&self, _stage: StageName, _attempt: u32, _delay_ms: u64, _reason: &str) {}

    fn on_exhausted(
        &self,
        _stage: StageName,
        _attempt: u32,
        _classified: &ClassifiedError,
        _elapsed_ms: u64,
    ) {
    }

    fn on_recovery(&self, _stage: StageName, _attempts: u32) {}
}

// ============================================================================
// SECTION: Backoff
// ============================================================================

/// Computes the delay before the attempt after `failed_attempt`.
///
/// The base doubles per failed attempt, clamps to the policy maximum, then
/// applies a deterministic jitter factor in [0.8, 1.2] derived from the
/// stage name and attempt number.
#[must_use]
pub fn backoff_delay_ms(policy: &RetryPolicy, stage: StageName, failed_attempt: u32) -> u64 {
    let doublings = failed_attempt.saturating_sub(1).min(32);
    let raw = policy.base_delay_ms.saturating_mul(1_u64 << doublings);
    let clamped = raw.min(policy.max_delay_ms);
    if !policy.jitter {
        return clamped;
    }
    let spread = jitter_permille(stage, failed_attempt);
    // spread is in [800, 1200] permille of the clamped delay.
    clamped.saturating_mul(spread) / 1_000
}

/// Deterministic jitter factor in permille, within [800, 1200].
fn jitter_permille(stage: StageName, attempt: u32) -> u64 {
    let mut seed = 0x9E37_79B9_7F4A_7C15_u64;
    for byte in stage.as_str().as_bytes() {
        seed = seed.wrapping_mul(31).wrapping_add(u64::from(*byte));
    }
    seed = seed.wrapping_add(u64::from(attempt).wrapping_mul(0x85EB_CA6B));
    seed ^= seed >> 33;
    seed = seed.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    seed ^= seed >> 33;
    800 + (seed % 401)
}

// ============================================================================
// SECTION: Retrier
// ============================================================================

/// Successful retry-loop outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    /// Attempt function result.
    pub result: T,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
}

/// Executes a stage attempt function under a retry policy.
///
/// Each failure is classified; non-retryable failures and exhausted budgets
/// surface as the classified error after `on_exhausted` fires. The deadline,
/// when present, is checked before every attempt and before every wait.
///
/// # Errors
///
/// Returns the [`ClassifiedError`] of the final failure, or a timeout
/// classification when the deadline expires mid-loop.
pub fn retry_stage<T, F>(
    stage: StageName,
    policy: &RetryPolicy,
    sink: &dyn RetrySink,
    waiter: &dyn Waiter,
    clock: &dyn Clock,
    deadline: Option<Timestamp>,
    mut attempt_fn: F,
) -> Result<RetryOutcome<T>, ClassifiedError>
where
    F: FnMut(u32) -> Result<T, AttemptFailure>,
{
    let started = clock.now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1_u32;
    loop {
        check_deadline(stage, clock, deadline)?;
        match attempt_fn(attempt) {
            Ok(result) => {
                if attempt > 1 {
                    sink.on_recovery(stage, attempt);
                }
                return Ok(RetryOutcome {
                    result,
                    attempts: attempt,
                });
            }
            Err(failure) => {
                let classified = classify(stage, &failure);
                let elapsed = clock.now().millis_since(started);
                if !classified.retryable || attempt >= max_attempts {
                    sink.on_exhausted(stage, attempt, &classified, elapsed);
                    return Err(classified);
                }
                let delay_ms = backoff_delay_ms(policy, stage, attempt);
                sink.on_retry(stage, attempt, delay_ms, &classified.original_message);
                check_deadline(stage, clock, deadline)?;
                waiter.wait(delay_ms);
                attempt += 1;
            }
        }
    }
}

/// Fails with a timeout classification when the deadline has passed.
fn check_deadline(
    stage: StageName,
    clock: &dyn Clock,
    deadline: Option<Timestamp>,
) -> Result<(), ClassifiedError> {
    match deadline {
        Some(limit) if clock.now() > limit => {
            Err(timeout_error(stage, "run exceeded its time budget"))
        }
        _ => Ok(()),
    }
}

// ============================================================================
// SECTION: Circuit Breaker
// ============================================================================

/// Consecutive failures required to open a circuit.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// Cooldown before an open circuit half-opens, in milliseconds.
pub const BREAKER_COOLDOWN_MS: i64 = 60_000;

/// Admission decision for a guarded call.
///
/// # Invariants
/// - `HalfOpen` admits exactly one probe per cooldown expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAdmission {
    /// Circuit closed; proceed.
    Allow,
    /// Circuit half-open; proceed as the probe call.
    HalfOpen,
    /// Circuit open; reject without attempting.
    Open,
}

/// Per-key breaker state.
#[derive(Debug, Clone, Copy, Default)]
struct BreakerEntry {
    /// Consecutive failures observed.
    consecutive_failures: u32,
    /// Open time, when the circuit is open.
    opened_at: Option<Timestamp>,
}

/// Circuit breaker keyed by source+stage strings.
///
/// # Invariants
/// - A circuit opens after [`BREAKER_FAILURE_THRESHOLD`] consecutive
///   failures, half-opens after [`BREAKER_COOLDOWN_MS`], and closes on the
///   first half-open success.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    /// Breaker state per key, guarded for shared use.
    entries: Mutex<BTreeMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    /// Creates a breaker with no tracked keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether a guarded call may proceed.
    #[must_use]
    pub fn admit(&self, key: &str, now: Timestamp) -> BreakerAdmission {
        let Ok(guard) = self.entries.lock() else {
            return BreakerAdmission::Allow;
        };
        guard.get(key).map_or(BreakerAdmission::Allow, |entry| match entry.opened_at {
            None => BreakerAdmission::Allow,
            Some(opened_at) => {
                if now >= opened_at.saturating_add_millis(BREAKER_COOLDOWN_MS) {
                    BreakerAdmission::HalfOpen
                } else {
                    BreakerAdmission::Open
                }
            }
        })
    }

    /// Records a successful guarded call, closing the circuit.
    pub fn record_success(&self, key: &str) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.remove(key);
        }
    }

    /// Records a failed guarded call, opening the circuit at the threshold.
    pub fn record_failure(&self, key: &str, now: Timestamp) {
        if let Ok(mut guard) = self.entries.lock() {
            let entry = guard.entry(key.to_string()).or_default();
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            if entry.consecutive_failures >= BREAKER_FAILURE_THRESHOLD {
                entry.opened_at = Some(now);
            }
        }
    }
}
