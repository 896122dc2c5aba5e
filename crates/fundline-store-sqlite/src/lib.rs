// fundline-store-sqlite/src/lib.rs
// ============================================================================
// Module: Fundline SQLite Store Library
// Description: Durable datastore implementation over SQLite.
// Purpose: Expose the SQLite-backed Datastore for servers and workers.
// Dependencies: fundline-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! This crate implements the complete `fundline-core` datastore contract
//! over SQLite with WAL journaling, canonical JSON row snapshots, an
//! advisory-lock table, and optimistic revision checks on mutable rows.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::SqliteDatastore;
pub use store::SqliteStoreConfig;
