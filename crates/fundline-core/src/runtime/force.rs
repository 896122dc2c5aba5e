// fundline-core/src/runtime/force.rs
// ============================================================================
// Module: Fundline Force-Reprocessing Flag
// Description: Per-source and global full-reprocessing overrides.
// Purpose: Read the override once per run, clear it on success, restore it on failure.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! Force full reprocessing bypasses duplicate detection for one run. The
//! flag is read exactly once at run start; mid-run changes do not affect the
//! running pipeline. A completed run that used the override clears the
//! per-source flag; a failed run restores it so the next run retries the
//! full reprocessing.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::core::identifiers::SourceId;
use crate::core::source::Source;
use crate::interfaces::DatastoreError;
use crate::interfaces::SourceStore;
use crate::interfaces::SystemConfigStore;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// System-config key for the process-wide override.
pub const GLOBAL_FORCE_FLAG_KEY: &str = "global_force_full_reprocessing";

// ============================================================================
// SECTION: Flag Operations
// ============================================================================

/// Returns whether full reprocessing is forced for the source.
///
/// True when the per-source flag or the global system-config flag is set.
///
/// # Errors
///
/// Returns [`DatastoreError`] when the global flag cannot be read.
pub fn should_force_full_processing(
    system_config: &dyn SystemConfigStore,
    source: &Source,
) -> Result<bool, DatastoreError> {
    if source.force_full_reprocessing {
        return Ok(true);
    }
    Ok(system_config.get_flag(GLOBAL_FORCE_FLAG_KEY)?.unwrap_or(false))
}

/// Clears the per-source flag after a completed run that used the override.
///
/// # Errors
///
/// Returns [`DatastoreError`] when the write fails.
pub fn clear_after_success(
    sources: &dyn SourceStore,
    source_id: &SourceId,
) -> Result<(), DatastoreError> {
    sources.set_force_full_reprocessing(source_id, false)
}

/// Restores the per-source flag after a failed run that used the override.
///
/// # Errors
///
/// Returns [`DatastoreError`] when the write fails.
pub fn restore_after_failure(
    sources: &dyn SourceStore,
    source_id: &SourceId,
) -> Result<(), DatastoreError> {
    sources.set_force_full_reprocessing(source_id, true)
}
