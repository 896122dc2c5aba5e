// fundline-core/src/runtime/lock.rs
// ============================================================================
// Module: Fundline Source Lock
// Description: Cooperative per-source lock over the advisory-lock primitive.
// Purpose: Serialize runs per source while degrading gracefully on contention.
// Dependencies: crate::core::identifiers, crate::interfaces
// ============================================================================

//! ## Overview
//! A source is processed by at most one run at a time under normal
//! operation. The lock is cooperative: when acquisition fails, or the lock
//! subsystem is unreachable, the run proceeds anyway and flags
//! `concurrent_processing_detected` so dashboards can filter affected runs.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::core::identifiers::SourceId;
use crate::interfaces::AdvisoryLock;
use crate::interfaces::LockHandle;

// ============================================================================
// SECTION: Lock Outcome
// ============================================================================

/// Result of a source-lock acquisition attempt.
///
/// # Invariants
/// - `handle` is present iff `acquired` is true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLockOutcome {
    /// Whether the lock was acquired.
    pub acquired: bool,
    /// Held lock handle, for release at run end.
    pub handle: Option<LockHandle>,
}

// ============================================================================
// SECTION: Source Lock
// ============================================================================

/// Attempts to acquire the per-source lock.
///
/// Lock-subsystem failures are swallowed into `acquired = false`; callers
/// must treat an unacquired lock as concurrent processing, never as a run
/// abort.
#[must_use]
pub fn try_acquire_source_lock(lock: &dyn AdvisoryLock, source_id: &SourceId) -> SourceLockOutcome {
    let key = source_id.lock_key();
    match lock.try_acquire(key) {
        Ok(Some(handle)) => SourceLockOutcome {
            acquired: true,
            handle: Some(handle),
        },
        Ok(None) | Err(_) => SourceLockOutcome {
            acquired: false,
            handle: None,
        },
    }
}

/// Releases a held source lock, ignoring release failures.
pub fn release_source_lock(lock: &dyn AdvisoryLock, outcome: &SourceLockOutcome) {
    if let Some(handle) = &outcome.handle {
        // Release failures leave a stale advisory row; the next acquire
        // attempt surfaces it as contention rather than an error.
        let _ = lock.release(handle);
    }
}
