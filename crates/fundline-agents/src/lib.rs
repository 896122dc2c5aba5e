// fundline-agents/src/lib.rs
// ============================================================================
// Module: Fundline Agents Library
// Description: Concrete pipeline collaborators for configured HTTP sources.
// Purpose: Provide the extractor, analyzer, analysis, filter, and storage agents.
// Dependencies: fundline-core, reqwest, serde_json, url
// ============================================================================

//! ## Overview
//! This crate implements the collaborator contracts from `fundline-core`:
//! an HTTP fetch agent with pagination and detail fan-out, a source
//! analyzer, an LM-backed analysis agent, a deterministic filter, a
//! datastore-backed storage agent, and a scripted LM client for tests.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod analysis;
pub mod analyzer;
pub mod filter;
pub mod http;
pub mod lm;
pub mod mapping;
pub mod path;
pub mod storage;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use analysis::HeuristicAnalysisAgent;
pub use analysis::LmAnalysisAgent;
pub use analyzer::ConfiguredSourceAnalyzer;
pub use filter::DEFAULT_MIN_RELEVANCE_SCORE;
pub use filter::ScoreThresholdFilter;
pub use http::HttpFetchAgent;
pub use http::HttpFetchConfig;
pub use lm::ScriptedLanguageModel;
pub use mapping::map_record;
pub use mapping::parse_date;
pub use path::parse_amount;
pub use path::resolve;
pub use path::resolve_amount;
pub use path::resolve_text;
pub use storage::DatastoreStorageAgent;
