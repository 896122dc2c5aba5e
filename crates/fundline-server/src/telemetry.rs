// fundline-server/src/telemetry.rs
// ============================================================================
// Module: Server Telemetry
// Description: Observability hooks for the admin surface and run lifecycle.
// Purpose: Provide metric events and audit records without hard dependencies.
// Dependencies: fundline-core, serde_json
// ============================================================================

//! ## Overview
//! The server exposes a thin metrics interface for request counters and a
//! sink for run-lifecycle audit events. Both are intentionally
//! dependency-light so deployments can plug in Prometheus or OpenTelemetry
//! without redesign. Audit records must never carry credentials or raw
//! upstream payloads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::sync::Mutex;

use fundline_core::RunId;
use fundline_core::SourceId;
use serde_json::json;

// ============================================================================
// SECTION: Metric Labels
// ============================================================================

/// Admin request outcome classification.
///
/// # Invariants
/// - Variants are stable for telemetry labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Successful request.
    Ok,
    /// Failed request.
    Error,
}

impl RequestOutcome {
    /// Returns a stable label for the outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Metrics sink for the admin surface.
pub trait ServerMetrics: Send + Sync {
    /// Records one admin request.
    fn record_request(&self, route: &str, outcome: RequestOutcome, latency_ms: u64);
}

/// Metrics sink that drops all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl ServerMetrics for NoopMetrics {
    fn record_request(&self, _route: &str, _outcome: RequestOutcome, _latency_ms: u64) {}
}

// ============================================================================
// SECTION: Audit Events
// ============================================================================

/// Run-lifecycle audit event.
///
/// # Invariants
/// - Events carry identifiers only, never payloads or credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// A run was enqueued for a source.
    RunEnqueued {
        /// Source being processed.
        source_id: SourceId,
        /// Enqueued run.
        run_id: RunId,
    },
    /// A run completed.
    RunCompleted {
        /// Completed run.
        run_id: RunId,
    },
    /// A run failed.
    RunFailed {
        /// Failed run.
        run_id: RunId,
        /// Failure category tag.
        category: String,
    },
    /// A source was created.
    SourceCreated {
        /// New source.
        source_id: SourceId,
    },
    /// A source was deleted.
    SourceDeleted {
        /// Deleted source.
        source_id: SourceId,
    },
}

/// Audit sink for run-lifecycle events.
pub trait AuditSink: Send + Sync {
    /// Records one audit event.
    fn record(&self, event: &AuditEvent);
}

/// Audit sink that drops all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

/// Audit sink writing JSON lines to stderr.
#[derive(Debug, Default)]
pub struct StderrAuditSink {
    /// Writer guard so concurrent events never interleave.
    guard: Mutex<()>,
}

impl AuditSink for StderrAuditSink {
    fn record(&self, event: &AuditEvent) {
        let line = match event {
            AuditEvent::RunEnqueued {
                source_id,
                run_id,
            } => json!({
                "event": "run_enqueued",
                "source_id": source_id,
                "run_id": run_id,
            }),
            AuditEvent::RunCompleted {
                run_id,
            } => json!({ "event": "run_completed", "run_id": run_id }),
            AuditEvent::RunFailed {
                run_id,
                category,
            } => json!({ "event": "run_failed", "run_id": run_id, "category": category }),
            AuditEvent::SourceCreated {
                source_id,
            } => json!({ "event": "source_created", "source_id": source_id }),
            AuditEvent::SourceDeleted {
                source_id,
            } => json!({ "event": "source_deleted", "source_id": source_id }),
        };
        let Ok(_held) = self.guard.lock() else {
            return;
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }
}
