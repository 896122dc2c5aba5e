// fundline-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Datastore
// Description: Durable Datastore backed by SQLite WAL.
// Purpose: Persist sources, opportunities, and run bookkeeping with
//          deterministic serialization and advisory locks.
// Dependencies: fundline-core, rusqlite, serde, serde_json
// ============================================================================

//! ## Overview
//! Rows are stored as canonical JSON snapshots beside the columns the
//! store queries on (identity, status, freshness, revision). Every write
//! that participates in optimistic concurrency re-checks the revision
//! column inside its statement. The advisory-lock primitive is a keyed
//! table insert, released by token. Loads fail closed on corrupt JSON.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;

use fundline_core::DuplicateDetectionSession;
use fundline_core::FieldPatch;
use fundline_core::FieldValue;
use fundline_core::MaterialField;
use fundline_core::Opportunity;
use fundline_core::OpportunityId;
use fundline_core::OpportunityPath;
use fundline_core::RawResponse;
use fundline_core::Run;
use fundline_core::RunId;
use fundline_core::Source;
use fundline_core::SourceConfiguration;
use fundline_core::SourceId;
use fundline_core::StageRecord;
use fundline_core::Timestamp;
use fundline_core::interfaces::AdvisoryLock;
use fundline_core::interfaces::Datastore;
use fundline_core::interfaces::DatastoreError;
use fundline_core::interfaces::LockHandle;
use fundline_core::interfaces::OpportunityStore;
use fundline_core::interfaces::RawResponseStore;
use fundline_core::interfaces::RunStore;
use fundline_core::interfaces::SourceStore;
use fundline_core::interfaces::SystemConfigStore;
use fundline_core::interfaces::RunWrite;
use fundline_core::interfaces::UpdateApplied;
use fundline_core::normalize_title;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Serialize;
use serde::de::DeserializeOwned;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// SQLite schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// SQLite store configuration.
///
/// # Invariants
/// - `path` points at a writable location for the owning process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteStoreConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
}

impl SqliteStoreConfig {
    /// Creates a configuration for the given database path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Durable datastore backed by SQLite.
pub struct SqliteDatastore {
    /// Connection guarded for serialized access.
    conn: Mutex<Connection>,
}

impl SqliteDatastore {
    /// Opens (and migrates) the store at the configured path.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the database cannot be opened,
    /// migrated, or its schema version is unsupported.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, DatastoreError> {
        let conn = Connection::open(&config.path).map_err(io_err)?;
        conn.pragma_update(None, "journal_mode", "wal").map_err(io_err)?;
        conn.pragma_update(None, "synchronous", "full").map_err(io_err)?;
        conn.pragma_update(None, "busy_timeout", i64::try_from(config.busy_timeout_ms).unwrap_or(0))
            .map_err(io_err)?;
        let version: i64 =
            conn.query_row("PRAGMA user_version", [], |row| row.get(0)).map_err(io_err)?;
        if version > SCHEMA_VERSION {
            return Err(DatastoreError::Corrupt(format!(
                "schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        if version < SCHEMA_VERSION {
            migrate(&conn)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION).map_err(io_err)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError`] when the database cannot be created.
    pub fn open_in_memory() -> Result<Self, DatastoreError> {
        let conn = Connection::open_in_memory().map_err(io_err)?;
        migrate(&conn)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION).map_err(io_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Locks the connection, mapping poisoning to a store error.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatastoreError> {
        self.conn.lock().map_err(|_| DatastoreError::Io("sqlite mutex poisoned".to_string()))
    }
}

/// Creates all tables and indexes.
fn migrate(conn: &Connection) -> Result<(), DatastoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_sources (
             source_id TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             organization TEXT NOT NULL,
             active INTEGER NOT NULL,
             last_checked_ms INTEGER,
             cadence_interval_ms INTEGER NOT NULL,
             force_full_reprocessing INTEGER NOT NULL,
             row JSON NOT NULL
         );
         CREATE TABLE IF NOT EXISTS api_source_configurations (
             source_id TEXT PRIMARY KEY,
             row JSON NOT NULL
         );
         CREATE TABLE IF NOT EXISTS funding_opportunities (
             opportunity_id TEXT PRIMARY KEY,
             source_id TEXT NOT NULL,
             api_opportunity_id TEXT NOT NULL,
             normalized_title TEXT NOT NULL,
             updated_at_ms INTEGER NOT NULL,
             revision INTEGER NOT NULL,
             row JSON NOT NULL,
             UNIQUE (source_id, api_opportunity_id)
         );
         CREATE INDEX IF NOT EXISTS idx_opportunities_title
             ON funding_opportunities (source_id, normalized_title);
         CREATE TABLE IF NOT EXISTS pipeline_runs (
             run_id TEXT PRIMARY KEY,
             source_id TEXT NOT NULL,
             status TEXT NOT NULL,
             started_at_ms INTEGER NOT NULL,
             revision INTEGER NOT NULL,
             row JSON NOT NULL
         );
         CREATE TABLE IF NOT EXISTS pipeline_stages (
             run_id TEXT NOT NULL,
             stage TEXT NOT NULL,
             job_id TEXT NOT NULL DEFAULT '',
             stage_order INTEGER NOT NULL,
             row JSON NOT NULL,
             PRIMARY KEY (run_id, stage, job_id)
         );
         CREATE TABLE IF NOT EXISTS opportunity_processing_paths (
             path_id INTEGER PRIMARY KEY AUTOINCREMENT,
             run_id TEXT NOT NULL,
             row JSON NOT NULL
         );
         CREATE TABLE IF NOT EXISTS duplicate_detection_sessions (
             run_id TEXT PRIMARY KEY,
             row JSON NOT NULL
         );
         CREATE TABLE IF NOT EXISTS api_raw_responses (
             raw_response_id TEXT PRIMARY KEY,
             source_id TEXT NOT NULL,
             captured_at_ms INTEGER NOT NULL,
             body JSON NOT NULL
         );
         CREATE TABLE IF NOT EXISTS system_config (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS advisory_locks (
             lock_key INTEGER PRIMARY KEY,
             token TEXT NOT NULL,
             acquired_at_ms INTEGER NOT NULL
         );",
    )
    .map_err(io_err)
}

// ============================================================================
// SECTION: Source Store
// ============================================================================

impl SourceStore for SqliteDatastore {
    fn get_source(&self, source_id: &SourceId) -> Result<Option<Source>, DatastoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT row FROM api_sources WHERE source_id = ?1",
            params![source_id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(io_err)?
        .map(|raw| decode(&raw))
        .transpose()
    }

    fn get_configuration(
        &self,
        source_id: &SourceId,
    ) -> Result<Option<SourceConfiguration>, DatastoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT row FROM api_source_configurations WHERE source_id = ?1",
            params![source_id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(io_err)?
        .map(|raw| decode(&raw))
        .transpose()
    }

    fn list_sources(&self) -> Result<Vec<Source>, DatastoreError> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare("SELECT row FROM api_sources ORDER BY source_id")
            .map_err(io_err)?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(io_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(io_err)?;
        rows.iter().map(|raw| decode(raw)).collect()
    }

    fn insert_source(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
    ) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO api_sources
                     (source_id, name, organization, active, last_checked_ms,
                      cadence_interval_ms, force_full_reprocessing, row)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    source.source_id.as_str(),
                    source.name,
                    source.organization,
                    i64::from(source.active),
                    source.last_checked.map(Timestamp::as_unix_millis),
                    source.update_frequency.interval_ms(),
                    i64::from(source.force_full_reprocessing),
                    encode(source)?,
                ],
            )
            .map_err(io_err)?;
        if inserted == 0 {
            return Err(DatastoreError::Duplicate(source.source_id.to_string()));
        }
        conn.execute(
            "INSERT OR REPLACE INTO api_source_configurations (source_id, row) VALUES (?1, ?2)",
            params![source.source_id.as_str(), encode(configuration)?],
        )
        .map_err(io_err)?;
        Ok(())
    }

    fn update_source(
        &self,
        source: &Source,
        configuration: &SourceConfiguration,
    ) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE api_sources SET name = ?2, organization = ?3, active = ?4,
                     last_checked_ms = ?5, cadence_interval_ms = ?6,
                     force_full_reprocessing = ?7, row = ?8
                 WHERE source_id = ?1",
                params![
                    source.source_id.as_str(),
                    source.name,
                    source.organization,
                    i64::from(source.active),
                    source.last_checked.map(Timestamp::as_unix_millis),
                    source.update_frequency.interval_ms(),
                    i64::from(source.force_full_reprocessing),
                    encode(source)?,
                ],
            )
            .map_err(io_err)?;
        if updated == 0 {
            return Err(DatastoreError::Invalid(format!("unknown source {}", source.source_id)));
        }
        conn.execute(
            "INSERT OR REPLACE INTO api_source_configurations (source_id, row) VALUES (?1, ?2)",
            params![source.source_id.as_str(), encode(configuration)?],
        )
        .map_err(io_err)?;
        Ok(())
    }

    fn delete_source(&self, source_id: &SourceId) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM api_sources WHERE source_id = ?1", params![source_id.as_str()])
            .map_err(io_err)?;
        conn.execute(
            "DELETE FROM api_source_configurations WHERE source_id = ?1",
            params![source_id.as_str()],
        )
        .map_err(io_err)?;
        Ok(())
    }

    fn stamp_last_checked(
        &self,
        source_id: &SourceId,
        checked_at: Timestamp,
    ) -> Result<(), DatastoreError> {
        self.mutate_source(source_id, |source| {
            source.last_checked = Some(checked_at);
            source.updated_at = checked_at;
        })
    }

    fn set_force_full_reprocessing(
        &self,
        source_id: &SourceId,
        enabled: bool,
    ) -> Result<(), DatastoreError> {
        self.mutate_source(source_id, |source| {
            source.force_full_reprocessing = enabled;
        })
    }

    fn next_due_source(&self, now: Timestamp) -> Result<Option<Source>, DatastoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT row FROM api_sources
             WHERE active = 1
               AND (last_checked_ms IS NULL
                    OR ?1 - last_checked_ms >= cadence_interval_ms)
             ORDER BY last_checked_ms IS NOT NULL, last_checked_ms ASC, source_id ASC
             LIMIT 1",
            params![now.as_unix_millis()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(io_err)?
        .map(|raw| decode(&raw))
        .transpose()
    }
}

impl SqliteDatastore {
    /// Loads, mutates, and rewrites one source row.
    fn mutate_source(
        &self,
        source_id: &SourceId,
        mutate: impl FnOnce(&mut Source),
    ) -> Result<(), DatastoreError> {
        let mut source = self
            .get_source(source_id)?
            .ok_or_else(|| DatastoreError::Invalid(format!("unknown source {source_id}")))?;
        mutate(&mut source);
        let conn = self.lock()?;
        conn.execute(
            "UPDATE api_sources SET active = ?2, last_checked_ms = ?3,
                 cadence_interval_ms = ?4, force_full_reprocessing = ?5, row = ?6
             WHERE source_id = ?1",
            params![
                source.source_id.as_str(),
                i64::from(source.active),
                source.last_checked.map(Timestamp::as_unix_millis),
                source.update_frequency.interval_ms(),
                i64::from(source.force_full_reprocessing),
                encode(&source)?,
            ],
        )
        .map_err(io_err)?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Opportunity Store
// ============================================================================

impl OpportunityStore for SqliteDatastore {
    fn find_by_api_ids(
        &self,
        source_id: &SourceId,
        api_ids: &[String],
    ) -> Result<Vec<Opportunity>, DatastoreError> {
        self.find_batch(source_id, "api_opportunity_id", api_ids)
    }

    fn find_by_normalized_titles(
        &self,
        source_id: &SourceId,
        normalized_titles: &[String],
    ) -> Result<Vec<Opportunity>, DatastoreError> {
        self.find_batch(source_id, "normalized_title", normalized_titles)
    }

    fn get_opportunity(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<Opportunity>, DatastoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT row FROM funding_opportunities WHERE opportunity_id = ?1",
            params![opportunity_id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(io_err)?
        .map(|raw| decode(&raw))
        .transpose()
    }

    fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO funding_opportunities
                     (opportunity_id, source_id, api_opportunity_id, normalized_title,
                      updated_at_ms, revision, row)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    opportunity.opportunity_id.as_str(),
                    opportunity.source_id.as_str(),
                    opportunity.api_opportunity_id.trim(),
                    normalize_title(&opportunity.title),
                    opportunity.updated_at.as_unix_millis(),
                    i64::try_from(opportunity.revision).unwrap_or(i64::MAX),
                    encode(opportunity)?,
                ],
            )
            .map_err(io_err)?;
        if inserted == 0 {
            return Err(DatastoreError::Duplicate(format!(
                "duplicate opportunity {} in source {}",
                opportunity.api_opportunity_id, opportunity.source_id
            )));
        }
        Ok(())
    }

    fn update_opportunity(
        &self,
        opportunity: &Opportunity,
        expected_revision: u64,
    ) -> Result<UpdateApplied, DatastoreError> {
        let mut refreshed = opportunity.clone();
        refreshed.revision = expected_revision + 1;
        let conn = self.lock()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM funding_opportunities WHERE opportunity_id = ?1",
                params![opportunity.opportunity_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(io_err)?;
        if exists.is_none() {
            return Ok(UpdateApplied::Missing);
        }
        let updated = conn
            .execute(
                "UPDATE funding_opportunities
                 SET normalized_title = ?2, updated_at_ms = ?3, revision = ?4, row = ?5
                 WHERE opportunity_id = ?1 AND revision = ?6",
                params![
                    refreshed.opportunity_id.as_str(),
                    normalize_title(&refreshed.title),
                    refreshed.updated_at.as_unix_millis(),
                    i64::try_from(refreshed.revision).unwrap_or(i64::MAX),
                    encode(&refreshed)?,
                    i64::try_from(expected_revision).unwrap_or(i64::MAX),
                ],
            )
            .map_err(io_err)?;
        if updated == 0 {
            return Ok(UpdateApplied::VersionConflict);
        }
        Ok(UpdateApplied::Applied)
    }

    fn apply_field_patches(
        &self,
        opportunity_id: &OpportunityId,
        patches: &[FieldPatch],
        expected_revision: u64,
        updated_at: Timestamp,
    ) -> Result<UpdateApplied, DatastoreError> {
        let Some(mut row) = self.get_opportunity(opportunity_id)? else {
            return Ok(UpdateApplied::Missing);
        };
        if row.revision != expected_revision {
            return Ok(UpdateApplied::VersionConflict);
        }
        for patch in patches {
            apply_patch(&mut row, patch);
        }
        row.updated_at = updated_at;
        self.update_opportunity(&row, expected_revision)
    }

    fn count_for_source(&self, source_id: &SourceId) -> Result<u64, DatastoreError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM funding_opportunities WHERE source_id = ?1",
                params![source_id.as_str()],
                |row| row.get(0),
            )
            .map_err(io_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl SqliteDatastore {
    /// Batched lookup by one indexed column within a source.
    fn find_batch(
        &self,
        source_id: &SourceId,
        column: &str,
        values: &[String],
    ) -> Result<Vec<Opportunity>, DatastoreError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "SELECT row FROM funding_opportunities
             WHERE source_id = ? AND {column} IN ({placeholders})"
        );
        let conn = self.lock()?;
        let mut statement = conn.prepare(&sql).map_err(io_err)?;
        let sid = source_id.as_str();
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(values.len() + 1);
        bound.push(&sid);
        for value in values {
            bound.push(value);
        }
        let rows = statement
            .query_map(bound.as_slice(), |row| row.get::<_, String>(0))
            .map_err(io_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(io_err)?;
        rows.iter().map(|raw| decode(raw)).collect()
    }
}

// ============================================================================
// SECTION: Run Store
// ============================================================================

impl RunStore for SqliteDatastore {
    fn insert_run(&self, run: &Run) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO pipeline_runs
                     (run_id, source_id, status, started_at_ms, revision, row)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.run_id.as_str(),
                    run.source_id.as_str(),
                    status_tag(run),
                    run.started_at.as_unix_millis(),
                    i64::try_from(run.revision).unwrap_or(i64::MAX),
                    encode(run)?,
                ],
            )
            .map_err(io_err)?;
        if inserted == 0 {
            return Err(DatastoreError::Duplicate(run.run_id.to_string()));
        }
        Ok(())
    }

    fn load_run(&self, run_id: &RunId) -> Result<Option<Run>, DatastoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT row FROM pipeline_runs WHERE run_id = ?1",
            params![run_id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(io_err)?
        .map(|raw| decode(&raw))
        .transpose()
    }

    fn update_run(&self, run: &Run, expected_revision: u64) -> Result<RunWrite, DatastoreError> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE pipeline_runs SET status = ?2, revision = ?3, row = ?4
                 WHERE run_id = ?1 AND revision = ?5",
                params![
                    run.run_id.as_str(),
                    status_tag(run),
                    i64::try_from(run.revision).unwrap_or(i64::MAX),
                    encode(run)?,
                    i64::try_from(expected_revision).unwrap_or(i64::MAX),
                ],
            )
            .map_err(io_err)?;
        if updated == 0 {
            return Ok(RunWrite::Conflict);
        }
        Ok(RunWrite::Applied)
    }

    fn upsert_stage(&self, stage: &StageRecord) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO pipeline_stages (run_id, stage, job_id, stage_order, row)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stage.run_id.as_str(),
                stage.stage.as_str(),
                stage.job_id.as_ref().map_or("", |job| job.as_str()),
                i64::from(stage.stage_order),
                encode(stage)?,
            ],
        )
        .map_err(io_err)?;
        Ok(())
    }

    fn load_stages(&self, run_id: &RunId) -> Result<Vec<StageRecord>, DatastoreError> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare(
                "SELECT row FROM pipeline_stages WHERE run_id = ?1 ORDER BY stage_order, job_id",
            )
            .map_err(io_err)?;
        let rows = statement
            .query_map(params![run_id.as_str()], |row| row.get::<_, String>(0))
            .map_err(io_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(io_err)?;
        rows.iter().map(|raw| decode(raw)).collect()
    }

    fn insert_path(&self, path: &OpportunityPath) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO opportunity_processing_paths (run_id, row) VALUES (?1, ?2)",
            params![path.run_id.as_str(), encode(path)?],
        )
        .map_err(io_err)?;
        Ok(())
    }

    fn load_paths(&self, run_id: &RunId) -> Result<Vec<OpportunityPath>, DatastoreError> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare(
                "SELECT row FROM opportunity_processing_paths
                 WHERE run_id = ?1 ORDER BY path_id",
            )
            .map_err(io_err)?;
        let rows = statement
            .query_map(params![run_id.as_str()], |row| row.get::<_, String>(0))
            .map_err(io_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(io_err)?;
        rows.iter().map(|raw| decode(raw)).collect()
    }

    fn insert_detection_session(
        &self,
        session: &DuplicateDetectionSession,
    ) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO duplicate_detection_sessions (run_id, row)
                 VALUES (?1, ?2)",
                params![session.run_id.as_str(), encode(session)?],
            )
            .map_err(io_err)?;
        if inserted == 0 {
            return Err(DatastoreError::Duplicate(format!(
                "duplicate detection session for run {}",
                session.run_id
            )));
        }
        Ok(())
    }

    fn load_detection_session(
        &self,
        run_id: &RunId,
    ) -> Result<Option<DuplicateDetectionSession>, DatastoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT row FROM duplicate_detection_sessions WHERE run_id = ?1",
            params![run_id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(io_err)?
        .map(|raw| decode(&raw))
        .transpose()
    }

    fn list_unfinished_runs(&self, cutoff: Timestamp) -> Result<Vec<Run>, DatastoreError> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare(
                "SELECT row FROM pipeline_runs
                 WHERE status IN ('started', 'processing') AND started_at_ms <= ?1
                 ORDER BY started_at_ms",
            )
            .map_err(io_err)?;
        let rows = statement
            .query_map(params![cutoff.as_unix_millis()], |row| row.get::<_, String>(0))
            .map_err(io_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(io_err)?;
        rows.iter().map(|raw| decode(raw)).collect()
    }
}

/// Stable status tag for run rows.
fn status_tag(run: &Run) -> &'static str {
    match run.status {
        fundline_core::RunStatus::Started => "started",
        fundline_core::RunStatus::Processing => "processing",
        fundline_core::RunStatus::Completed => "completed",
        fundline_core::RunStatus::Failed => "failed",
    }
}

// ============================================================================
// SECTION: Advisory Locks
// ============================================================================

impl AdvisoryLock for SqliteDatastore {
    fn try_acquire(&self, key: i64) -> Result<Option<LockHandle>, DatastoreError> {
        let conn = self.lock()?;
        let token = format!("lock-{key}-{}", next_token(&conn)?);
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO advisory_locks (lock_key, token, acquired_at_ms)
                 VALUES (?1, ?2, 0)",
                params![key, token],
            )
            .map_err(io_err)?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(LockHandle {
            key,
            token,
        }))
    }

    fn release(&self, handle: &LockHandle) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM advisory_locks WHERE lock_key = ?1 AND token = ?2",
            params![handle.key, handle.token],
        )
        .map_err(io_err)?;
        Ok(())
    }
}

/// Monotonic token counter backed by the system-config table.
fn next_token(conn: &Connection) -> Result<i64, DatastoreError> {
    conn.execute(
        "INSERT INTO system_config (key, value) VALUES ('lock_token_counter', '1')
         ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
        [],
    )
    .map_err(io_err)?;
    let raw: String = conn
        .query_row(
            "SELECT value FROM system_config WHERE key = 'lock_token_counter'",
            [],
            |row| row.get(0),
        )
        .map_err(io_err)?;
    raw.trim_matches('"')
        .parse::<i64>()
        .map_err(|_| DatastoreError::Corrupt("lock token counter is not numeric".to_string()))
}

// ============================================================================
// SECTION: System Config and Raw Responses
// ============================================================================

impl SystemConfigStore for SqliteDatastore {
    fn get_flag(&self, key: &str) -> Result<Option<bool>, DatastoreError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM system_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(io_err)?;
        Ok(raw.and_then(|value| serde_json::from_str::<bool>(&value).ok()))
    }

    fn set_flag(&self, key: &str, value: bool) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO system_config (key, value) VALUES (?1, ?2)",
            params![key, if value { "true" } else { "false" }],
        )
        .map_err(io_err)?;
        Ok(())
    }
}

impl RawResponseStore for SqliteDatastore {
    fn store_raw_response(
        &self,
        source_id: &SourceId,
        body: &serde_json::Value,
        captured_at: Timestamp,
    ) -> Result<String, DatastoreError> {
        let conn = self.lock()?;
        let raw_response_id = format!("raw-{}-{}", source_id.lock_key(), next_token(&conn)?);
        conn.execute(
            "INSERT INTO api_raw_responses (raw_response_id, source_id, captured_at_ms, body)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                raw_response_id,
                source_id.as_str(),
                captured_at.as_unix_millis(),
                body.to_string(),
            ],
        )
        .map_err(io_err)?;
        Ok(raw_response_id)
    }

    fn load_raw_response(
        &self,
        raw_response_id: &str,
    ) -> Result<Option<RawResponse>, DatastoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT source_id, captured_at_ms, body FROM api_raw_responses
             WHERE raw_response_id = ?1",
            params![raw_response_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()
        .map_err(io_err)?
        .map(|(source_id, captured_at_ms, body)| {
            let source_id = SourceId::parse(&source_id)
                .map_err(|err| DatastoreError::Corrupt(err.to_string()))?;
            let body = serde_json::from_str(&body)
                .map_err(|err| DatastoreError::Corrupt(err.to_string()))?;
            Ok(RawResponse {
                raw_response_id: raw_response_id.to_string(),
                source_id,
                body,
                captured_at: Timestamp::from_unix_millis(captured_at_ms),
            })
        })
        .transpose()
    }
}

impl Datastore for SqliteDatastore {
    fn readiness(&self) -> Result<(), DatastoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).map_err(io_err)?;
        Ok(())
    }
}

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
        (MaterialField::Description, FieldValue::Text(value)) => row.description.clone_from(value),
        (MaterialField::Eligibility, FieldValue::Text(value)) => row.eligibility.clone_from(value),
        (MaterialField::Url, FieldValue::Text(value)) => row.url.clone_from(value),
        (MaterialField::CloseDate, FieldValue::Time(value)) => row.close_date = *value,
        (MaterialField::MinAward, FieldValue::Number(value)) => row.min_award = *value,
        (MaterialField::MaxAward, FieldValue::Number(value)) => row.max_award = *value,
        (MaterialField::TotalFunding, FieldValue::Number(value)) => row.total_funding = *value,
        _ => {}
    }
}

// ============================================================================
// SECTION: Serialization Helpers
// ============================================================================

/// Encodes a record as canonical JSON.
fn encode<T: Serialize>(value: &T) -> Result<String, DatastoreError> {
    serde_json::to_string(value).map_err(|err| DatastoreError::Invalid(err.to_string()))
}

/// Decodes a stored JSON snapshot, failing closed on corruption.
fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, DatastoreError> {
    serde_json::from_str(raw).map_err(|err| DatastoreError::Corrupt(err.to_string()))
}

/// Maps a SQLite error to the store error type.
fn io_err(err: rusqlite::Error) -> DatastoreError {
    DatastoreError::Io(err.to_string())
}
