// fundline-core/src/runtime/store.rs
// ============================================================================
// Module: Fundline In-Memory Datastore
// Description: Deterministic in-memory datastore for tests and examples.
// Purpose: Provide the full datastore contract without external dependencies.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! This module implements the complete [`Datastore`] contract over guarded
//! in-memory maps. It is deterministic, supports the advisory-lock and
//! optimistic-concurrency protocols, and is not intended for production use.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde_json::Value;

use crate::core::DuplicateDetectionSession;
use crate::core::FieldPatch;
use crate::core::FieldValue;
use crate::core::MaterialField;
use crate::core::Opportunity;
use crate::core::OpportunityId;
use crate::core::OpportunityPath;
use crate::core::RawResponse;
use crate::core::Run;
use crate::core::RunId;
use crate::core::Source;
use crate::core::SourceConfiguration;
use crate::core::SourceId;
use crate::core::StageRecord;
use crate::core::Timestamp;
use crate::interfaces::AdvisoryLock;
use crate::interfaces::Datastore;
use crate::interfaces::DatastoreError;
use crate::interfaces::LockHandle;
use crate::interfaces::OpportunityStore;
use crate::interfaces::RawResponseStore;
use crate::interfaces::RunStore;
use crate::interfaces::RunWrite;
use crate::interfaces::SourceStore;
use crate::interfaces::SystemConfigStore;
use crate::interfaces::UpdateApplied;

// ============================================================================
// SECTION: Inner State
// ============================================================================

/// Guarded tables for the in-memory datastore.
#[derive(Debug, Default)]
struct Tables {
    /// Source rows keyed by identifier.
    sources: BTreeMap<SourceId, Source>,
    /// Configuration bundles keyed by source.
    configurations: BTreeMap<SourceId, SourceConfiguration>,
    /// Canonical opportunities keyed by identifier.
    opportunities: BTreeMap<OpportunityId, Opportunity>,
    /// Run rows keyed by identifier.
    runs: BTreeMap<RunId, Run>,
    /// Stage rows keyed by run, stage tag, and job tag.
    stages: BTreeMap<(RunId, String, String), StageRecord>,
    /// Path rows in insertion order.
    paths: Vec<OpportunityPath>,
    /// Detection sessions keyed by run.
    sessions: BTreeMap<RunId, DuplicateDetectionSession>,
    /// Held advisory-lock keys with their tokens.
    locks: BTreeMap<i64, String>,
    /// Released tokens, for idempotent release.
    released_tokens: BTreeSet<String>,
    /// System-config flags.
    flags: BTreeMap<String, bool>,
    /// Raw responses keyed by reference.
    raw_responses: BTreeMap<String, RawResponse>,
    /// Counter for raw-response references.
    raw_counter: u64,
    /// Counter for lock tokens.
    lock_counter: u64,
}

// ============================================================================
// SECTION: In-Memory Datastore
// ============================================================================

/// In-memory datastore for tests and examples.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDatastore {
    /// Tables protected by a mutex.
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDatastore {
    /// Creates an empty datastore.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the tables, mapping poisoning to a store error.
    fn lock(&self) -> Result<MutexGuard<'_, Tables>, DatastoreError> {
        self.tables.lock().map_err(|_| DatastoreError::Io("datastore mutex poisoned".to_string()))
    }

    /// Returns all canonical opportunities, for test assertions.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the tables cannot be locked.
    pub fn all_opportunities(&self) -> Result<Vec<Opportunity>, DatastoreError> {
        Ok(self.lock()?.opportunities.values().cloned().collect())
    }
}

impl SourceStore for InMemoryDatastore {
    fn get_source(&self, source_id: &SourceId) -> Result<Option<Source>, DatastoreError> {
        Ok(self.lock()?.sources.get(source_id).cloned())
    }

    fn get_configuration(
        &self,
        source_id: &SourceId,
    ) -> Result<Option<SourceConfiguration>, DatastoreError> {
        Ok(self.lock()?.configurations.get(source_id).cloned())
    }

    fn list_sources(&self) -> Result<Vec<Source>, DatastoreError> {
        Ok(self.lock()?.sources.values().cloned().collect())
    }

    fn insert_source(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
    ) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        if tables.sources.contains_key(&source.source_id) {
            return Err(DatastoreError::Duplicate(source.source_id.to_string()));
        }
        tables.sources.insert(source.source_id.clone(), source.clone());
        tables.configurations.insert(source.source_id.clone(), configuration.clone());
        Ok(())
    }

    fn update_source(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
    ) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        if !tables.sources.contains_key(&source.source_id) {
            return Err(DatastoreError::Invalid(format!("unknown source {}", source.source_id)));
        }
        tables.sources.insert(source.source_id.clone(), source.clone());
        tables.configurations.insert(source.source_id.clone(), configuration.clone());
        Ok(())
    }

    fn delete_source(&self, source_id: &SourceId) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        tables.sources.remove(source_id);
        tables.configurations.remove(source_id);
        Ok(())
    }

    fn stamp_last_checked(
        &self,
        source_id: &SourceId,
        checked_at: Timestamp,
    ) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        let source = tables
            .sources
            .get_mut(source_id)
            .ok_or_else(|| DatastoreError::Invalid(format!("unknown source {source_id}")))?;
        source.last_checked = Some(checked_at);
        source.updated_at = checked_at;
        Ok(())
    }

    fn set_force_full_reprocessing(
        &self,
        source_id: &SourceId,
        enabled: bool,
    ) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        let source = tables
            .sources
            .get_mut(source_id)
            .ok_or_else(|| DatastoreError::Invalid(format!("unknown source {source_id}")))?;
        source.force_full_reprocessing = enabled;
        Ok(())
    }

    fn next_due_source(&self, now: Timestamp) -> Result<Option<Source>, DatastoreError> {
        let tables = self.lock()?;
        let mut due: Vec<&Source> = tables
            .sources
            .values()
            .filter(|source| source.active)
            .filter(|source| {
                source.last_checked.is_none_or(|checked| {
                    now.as_unix_millis().saturating_sub(checked.as_unix_millis())
                        >= source.update_frequency.interval_ms()
                })
            })
            .collect();
        due.sort_by_key(|source| {
            (source.last_checked.map_or(i64::MIN, Timestamp::as_unix_millis), source.source_id.clone())
        });
        Ok(due.first().map(|source| (*source).clone()))
    }
}

impl OpportunityStore for InMemoryDatastore {
    fn find_by_api_ids(
        &self,
        source_id: &SourceId,
        api_ids: &[String],
    ) -> Result<Vec<Opportunity>, DatastoreError> {
        let wanted: BTreeSet<&str> = api_ids.iter().map(String::as_str).collect();
        Ok(self
            .lock()?
            .opportunities
            .values()
            .filter(|row| &row.source_id == source_id)
            .filter(|row| wanted.contains(row.api_opportunity_id.trim()))
            .cloned()
            .collect())
    }

    fn find_by_normalized_titles(
        &self,
        source_id: &SourceId,
        normalized_titles: &[String],
    ) -> Result<Vec<Opportunity>, DatastoreError> {
        let wanted: BTreeSet<&str> = normalized_titles.iter().map(String::as_str).collect();
        Ok(self
            .lock()?
            .opportunities
            .values()
            .filter(|row| &row.source_id == source_id)
            .filter(|row| wanted.contains(row.normalized_title().as_str()))
            .cloned()
            .collect())
    }

    fn get_opportunity(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<Opportunity>, DatastoreError> {
        Ok(self.lock()?.opportunities.get(opportunity_id).cloned())
    }

    fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        let duplicate = tables.opportunities.values().any(|row| {
            row.source_id == opportunity.source_id
                && row.api_opportunity_id.trim() == opportunity.api_opportunity_id.trim()
        });
        if duplicate {
            return Err(DatastoreError::Duplicate(format!(
                "duplicate opportunity {} in source {}",
                opportunity.api_opportunity_id, opportunity.source_id
            )));
        }
        tables.opportunities.insert(opportunity.opportunity_id.clone(), opportunity.clone());
        Ok(())
    }

    fn update_opportunity(
        &self,
        opportunity: &Opportunity,
        expected_revision: u64,
    ) -> Result<UpdateApplied, DatastoreError> {
        let mut tables = self.lock()?;
        let Some(row) = tables.opportunities.get_mut(&opportunity.opportunity_id) else {
            return Ok(UpdateApplied::Missing);
        };
        if row.revision != expected_revision {
            return Ok(UpdateApplied::VersionConflict);
        }
        *row = opportunity.clone();
        row.revision = expected_revision + 1;
        Ok(UpdateApplied::Applied)
    }

    fn apply_field_patches(
        &self,
        opportunity_id: &OpportunityId,
        patches: &[FieldPatch],
        expected_revision: u64,
        updated_at: Timestamp,
    ) -> Result<UpdateApplied, DatastoreError> {
        let mut tables = self.lock()?;
        let Some(row) = tables.opportunities.get_mut(opportunity_id) else {
            return Ok(UpdateApplied::Missing);
        };
        if row.revision != expected_revision {
            return Ok(UpdateApplied::VersionConflict);
        }
        for patch in patches {
            apply_patch(row, patch);
        }
        row.updated_at = updated_at;
        row.revision += 1;
        Ok(UpdateApplied::Applied)
    }

    fn count_for_source(&self, source_id: &SourceId) -> Result<u64, DatastoreError> {
        let count =
            self.lock()?.opportunities.values().filter(|row| &row.source_id == source_id).count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}

impl RunStore for InMemoryDatastore {
    fn insert_run(&self, run: &Run) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        if tables.runs.contains_key(&run.run_id) {
            return Err(DatastoreError::Duplicate(run.run_id.to_string()));
        }
        tables.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn load_run(&self, run_id: &RunId) -> Result<Option<Run>, DatastoreError> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    fn update_run(&self, run: &Run, expected_revision: u64) -> Result<RunWrite, DatastoreError> {
        let mut tables = self.lock()?;
        let Some(existing) = tables.runs.get_mut(&run.run_id) else {
            return Err(DatastoreError::Invalid(format!("unknown run {}", run.run_id)));
        };
        if existing.revision != expected_revision {
            return Ok(RunWrite::Conflict);
        }
        *existing = run.clone();
        Ok(RunWrite::Applied)
    }

    fn upsert_stage(&self, stage: &StageRecord) -> Result<(), DatastoreError> {
        let key = (
            stage.run_id.clone(),
            stage.stage.as_str().to_string(),
            stage.job_id.as_ref().map_or_else(String::new, |job| job.as_str().to_string()),
        );
        self.lock()?.stages.insert(key, stage.clone());
        Ok(())
    }

    fn load_stages(&self, run_id: &RunId) -> Result<Vec<StageRecord>, DatastoreError> {
        let mut stages: Vec<StageRecord> = self
            .lock()?
            .stages
            .values()
            .filter(|stage| &stage.run_id == run_id)
            .cloned()
            .collect();
        stages.sort_by_key(|stage| stage.stage_order);
        Ok(stages)
    }

    fn insert_path(&self, path: &OpportunityPath) -> Result<(), DatastoreError> {
        self.lock()?.paths.push(path.clone());
        Ok(())
    }

    fn load_paths(&self, run_id: &RunId) -> Result<Vec<OpportunityPath>, DatastoreError> {
        Ok(self.lock()?.paths.iter().filter(|path| &path.run_id == run_id).cloned().collect())
    }

    fn insert_detection_session(
        &self,
        session: &DuplicateDetectionSession,
    ) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        if tables.sessions.contains_key(&session.run_id) {
            return Err(DatastoreError::Duplicate(format!(
                "duplicate detection session for run {}",
                session.run_id
            )));
        }
        tables.sessions.insert(session.run_id.clone(), session.clone());
        Ok(())
    }

    fn load_detection_session(
        &self,
        run_id: &RunId,
    ) -> Result<Option<DuplicateDetectionSession>, DatastoreError> {
        Ok(self.lock()?.sessions.get(run_id).cloned())
    }

    fn list_unfinished_runs(&self, cutoff: Timestamp) -> Result<Vec<Run>, DatastoreError> {
        Ok(self
            .lock()?
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .filter(|run| run.started_at <= cutoff)
            .cloned()
            .collect())
    }
}

impl AdvisoryLock for InMemoryDatastore {
    fn try_acquire(&self, key: i64) -> Result<Option<LockHandle>, DatastoreError> {
        let mut tables = self.lock()?;
        if tables.locks.contains_key(&key) {
            return Ok(None);
        }
        tables.lock_counter += 1;
        let token = format!("lock-{}", tables.lock_counter);
        tables.locks.insert(key, token.clone());
        Ok(Some(LockHandle {
            key,
            token,
        }))
    }

    fn release(&self, handle: &LockHandle) -> Result<(), DatastoreError> {
        let mut tables = self.lock()?;
        if tables.released_tokens.contains(&handle.token) {
            return Ok(());
        }
        match tables.locks.get(&handle.key) {
            Some(token) if *token == handle.token => {
                tables.locks.remove(&handle.key);
                tables.released_tokens.insert(handle.token.clone());
                Ok(())
            }
            _ => Err(DatastoreError::Invalid(format!("lock not held: key {}", handle.key))),
        }
    }
}

impl SystemConfigStore for InMemoryDatastore {
    fn get_flag(&self, key: &str) -> Result<Option<bool>, DatastoreError> {
        Ok(self.lock()?.flags.get(key).copied())
    }

    fn set_flag(&self, key: &str, value: bool) -> Result<(), DatastoreError> {
        self.lock()?.flags.insert(key.to_string(), value);
        Ok(())
    }
}

impl RawResponseStore for InMemoryDatastore {
    fn store_raw_response(
        &self,
        source_id: &SourceId,
        body: &Value,
        captured_at: Timestamp,
    ) -> Result<String, DatastoreError> {
        let mut tables = self.lock()?;
        tables.raw_counter += 1;
        let raw_response_id = format!("raw-{}", tables.raw_counter);
        tables.raw_responses.insert(
            raw_response_id.clone(),
            RawResponse {
                raw_response_id: raw_response_id.clone(),
                source_id: source_id.clone(),
                body: body.clone(),
                captured_at,
            },
        );
        Ok(raw_response_id)
    }

    fn load_raw_response(
        &self,
        raw_response_id: &str,
    ) -> Result<Option<RawResponse>, DatastoreError> {
        Ok(self.lock()?.raw_responses.get(raw_response_id).cloned())
    }
}

impl Datastore for InMemoryDatastore {}

// ============================================================================
// SECTION: Patch Application
// ============================================================================

/// Applies one typed field patch to a canonical row.
fn apply_patch(row: &mut Opportunity, patch: &FieldPatch) {
    match (patch.field, &patch.value) {
        (MaterialField::Title, FieldValue::Text(value)) => {
            if let Some(title) = value {
                row.title.clone_from(title);
            }
        }
        (MaterialField::Description, FieldValue::Text(value)) => {
            row.description.clone_from(value);
        }
        (MaterialField::Eligibility, FieldValue::Text(value)) => {
            row.eligibility.clone_from(value);
        }
        (MaterialField::Url, FieldValue::Text(value)) => {
            row.url.clone_from(value);
        }
        (MaterialField::CloseDate, FieldValue::Time(value)) => {
            row.close_date = *value;
        }
        (MaterialField::MinAward, FieldValue::Number(value)) => {
            row.min_award = *value;
        }
        (MaterialField::MaxAward, FieldValue::Number(value)) => {
            row.max_award = *value;
        }
        (MaterialField::TotalFunding, FieldValue::Number(value)) => {
            row.total_funding = *value;
        }
        _ => {}
    }
}

// ============================================================================
// SECTION: Shared Datastore Wrapper
// ============================================================================

/// Shared datastore backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedDatastore {
    /// Inner datastore implementation.
    inner: Arc<dyn Datastore>,
}

impl SharedDatastore {
    /// Wraps a datastore in a shared, clonable wrapper.
    #[must_use]
    pub fn from_store(store: impl Datastore + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wraps an existing shared datastore.
    #[must_use]
    pub const fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            inner: store,
        }
    }

    /// Returns the inner shared datastore.
    #[must_use]
    pub fn inner(&self) -> Arc<dyn Datastore> {
        Arc::clone(&self.inner)
    }
}
