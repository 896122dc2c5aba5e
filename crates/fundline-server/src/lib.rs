// fundline-server/src/lib.rs
// ============================================================================
// Module: Fundline Server Library
// Description: Admin HTTP surface for the ingestion pipeline.
// Purpose: Expose source CRUD, run enqueueing, and system configuration.
// Dependencies: fundline-core, fundline-config, axum, tokio
// ============================================================================

//! ## Overview
//! This crate hosts the admin surface: a minimal JSON API over axum with
//! structured error bodies, a near-duplicate guard on source creation, and
//! trait-based metrics and audit sinks.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod server;
pub mod similarity;
pub mod telemetry;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use server::AdminServerConfig;
pub use server::AppState;
pub use server::SourceBody;
pub use server::admin_router;
pub use server::serve;
pub use similarity::identity_similarity;
pub use similarity::identity_text;
pub use telemetry::AuditEvent;
pub use telemetry::AuditSink;
pub use telemetry::NoopAuditSink;
pub use telemetry::NoopMetrics;
pub use telemetry::RequestOutcome;
pub use telemetry::ServerMetrics;
pub use telemetry::StderrAuditSink;
