//! Ledger store trait and SQLite implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StoreError;
use super::schema;
use super::types::{
    CloseOutcome, EntityKind, LedgerRow, LedgerSummary, LookupRow, MembershipRecord,
    OpenOutcome, RunStats, RunStatus, TableNames,
};

/// Set-based operations the reconciliation engine issues against the
/// relational store.
///
/// Every write is guarded so that re-running it against already-converged
/// state is a no-op rather than an error. The trait is object-safe and is
/// used as `&dyn LedgerStore` / `Arc<dyn LedgerStore>`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fetch every ledger row with `removed_at IS NULL`, keyed by track id.
    async fn fetch_active(&self) -> Result<HashMap<String, LedgerRow>, StoreError>;

    /// Close the active row of each track at `removed_at`.
    ///
    /// A track with no active row is reported in `already_closed` instead of
    /// failing.
    async fn close_memberships(
        &self,
        track_ids: &[String],
        removed_at: DateTime<Utc>,
    ) -> Result<CloseOutcome, StoreError>;

    /// Append one active row per record, skipping tracks that already have
    /// an active row.
    async fn open_memberships(
        &self,
        records: &[MembershipRecord],
    ) -> Result<OpenOutcome, StoreError>;

    /// Insert lookup rows whose id is not yet present. Existing rows are
    /// never overwritten. Returns the number of rows created.
    async fn insert_lookups_if_absent(
        &self,
        kind: EntityKind,
        rows: &[LookupRow],
    ) -> Result<u64, StoreError>;

    /// Get a single lookup row.
    async fn get_lookup(&self, kind: EntityKind, id: &str)
        -> Result<Option<LookupRow>, StoreError>;

    /// All ledger rows for a track, oldest first.
    async fn track_history(&self, track_id: &str) -> Result<Vec<LedgerRow>, StoreError>;

    /// Record the start of a reconciliation run and return its id.
    async fn start_run(&self) -> Result<i64, StoreError>;

    /// Mark a run as succeeded with its counts.
    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StoreError>;

    /// Mark a run as failed.
    async fn fail_run(&self, run_id: i64, error: &str) -> Result<(), StoreError>;

    /// Get a summary of the ledger and the most recent run.
    async fn get_summary(&self) -> Result<LedgerSummary, StoreError>;
}

/// SQLite implementation of the ledger store.
pub struct SqliteLedgerStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
    tables: TableNames,
}

impl std::fmt::Debug for SqliteLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedgerStore")
            .field("path", &self.path)
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl SqliteLedgerStore {
    /// Open or create a ledger database at the given path.
    pub async fn open(path: &Path, tables: TableNames) -> Result<Self, StoreError> {
        tables.validate()?;
        let path = path.to_path_buf();
        let path_clone = path.clone();
        let tables_clone = tables.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StoreError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .map_err(StoreError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StoreError::Migration)?;

            schema::migrate(&conn, &tables_clone)?;

            Ok::<_, StoreError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            tables,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open_in_memory_with(TableNames::default())
    }

    /// Open an in-memory database with custom table names (for testing).
    #[cfg(test)]
    pub fn open_in_memory_with(tables: TableNames) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn, &tables)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            tables,
        })
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    fn count(conn: &Connection, sql: &str) -> Result<u64, StoreError> {
        let n = conn
            .query_row(sql, [], |row| row.get::<_, i64>(0))
            .map_err(StoreError::query)?;
        Ok(n as u64)
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn fetch_active(&self) -> Result<HashMap<String, LedgerRow>, StoreError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT id, track_id, artist_id, album_id, added_at, removed_at FROM {} WHERE removed_at IS NULL",
                self.tables.ledger
            ))
            .map_err(StoreError::query)?;

        let active = stmt
            .query_map([], |row| {
                let ledger_row = row_to_ledger_row(row)?;
                Ok((ledger_row.track_id.clone(), ledger_row))
            })
            .map_err(StoreError::query)?
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(StoreError::query)?;

        Ok(active)
    }

    async fn close_memberships(
        &self,
        track_ids: &[String],
        removed_at: DateTime<Utc>,
    ) -> Result<CloseOutcome, StoreError> {
        let mut outcome = CloseOutcome::default();
        if track_ids.is_empty() {
            return Ok(outcome);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StoreError::query)?;
        {
            // `removed_at IS NULL` is the concurrent-modification guard.
            let mut stmt = tx
                .prepare_cached(&format!(
                    "UPDATE {} SET removed_at = ?1 WHERE track_id = ?2 AND removed_at IS NULL",
                    self.tables.ledger
                ))
                .map_err(StoreError::query)?;

            for track_id in track_ids {
                let changed = stmt
                    .execute(rusqlite::params![removed_at.timestamp_millis(), track_id])
                    .map_err(StoreError::query)?;
                if changed == 0 {
                    outcome.already_closed.push(track_id.clone());
                } else {
                    outcome.closed += changed as u64;
                }
            }
        }
        tx.commit().map_err(StoreError::query)?;

        Ok(outcome)
    }

    async fn open_memberships(
        &self,
        records: &[MembershipRecord],
    ) -> Result<OpenOutcome, StoreError> {
        let mut outcome = OpenOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StoreError::query)?;
        {
            // Re-check for an active row inside the statement itself so a
            // repeated delivery of the same cycle cannot append twice.
            let mut stmt = tx
                .prepare_cached(&format!(
                    r#"
                    INSERT INTO {ledger} (track_id, artist_id, album_id, added_at, removed_at)
                    SELECT ?1, ?2, ?3, ?4, NULL
                    WHERE NOT EXISTS (
                        SELECT 1 FROM {ledger} WHERE track_id = ?1 AND removed_at IS NULL
                    )
                    "#,
                    ledger = self.tables.ledger
                ))
                .map_err(StoreError::query)?;

            for record in records {
                let inserted = stmt
                    .execute(rusqlite::params![
                        record.track_id,
                        record.artist_id,
                        record.album_id,
                        record.added_at.timestamp_millis(),
                    ])
                    .map_err(StoreError::query)?;
                if inserted == 0 {
                    outcome.already_active.push(record.track_id.clone());
                } else {
                    outcome.opened += inserted as u64;
                }
            }
        }
        tx.commit().map_err(StoreError::query)?;

        Ok(outcome)
    }

    async fn insert_lookups_if_absent(
        &self,
        kind: EntityKind,
        rows: &[LookupRow],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StoreError::query)?;
        let mut created = 0u64;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT INTO {} (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
                    self.tables.lookup(kind)
                ))
                .map_err(StoreError::query)?;

            for row in rows {
                created += stmt
                    .execute(rusqlite::params![row.id, row.name])
                    .map_err(StoreError::query)? as u64;
            }
        }
        tx.commit().map_err(StoreError::query)?;

        Ok(created)
    }

    async fn get_lookup(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<LookupRow>, StoreError> {
        let conn = self.lock()?;

        conn.query_row(
            &format!("SELECT id, name FROM {} WHERE id = ?1", self.tables.lookup(kind)),
            [id],
            |row| {
                Ok(LookupRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn track_history(&self, track_id: &str) -> Result<Vec<LedgerRow>, StoreError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT id, track_id, artist_id, album_id, added_at, removed_at FROM {} WHERE track_id = ?1 ORDER BY id",
                self.tables.ledger
            ))
            .map_err(StoreError::query)?;

        let rows = stmt
            .query_map([track_id], row_to_ledger_row)
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;

        Ok(rows)
    }

    async fn start_run(&self) -> Result<i64, StoreError> {
        let started_at = Utc::now().timestamp_millis();

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (started_at, status) VALUES (?1, ?2)",
                self.tables.runs
            ),
            rusqlite::params![started_at, RunStatus::Running.as_str()],
        )
        .map_err(StoreError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StoreError> {
        let completed_at = Utc::now().timestamp_millis();

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "UPDATE {} SET completed_at = ?1, added = ?2, removed = ?3, malformed = ?4, lookups_created = ?5, status = ?6, error = NULL WHERE id = ?7",
                self.tables.runs
            ),
            rusqlite::params![
                completed_at,
                stats.added as i64,
                stats.removed as i64,
                stats.malformed as i64,
                stats.lookups_created as i64,
                RunStatus::Succeeded.as_str(),
                run_id,
            ],
        )
        .map_err(StoreError::query)?;

        Ok(())
    }

    async fn fail_run(&self, run_id: i64, error: &str) -> Result<(), StoreError> {
        let completed_at = Utc::now().timestamp_millis();

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "UPDATE {} SET completed_at = ?1, status = ?2, error = ?3 WHERE id = ?4",
                self.tables.runs
            ),
            rusqlite::params![completed_at, RunStatus::Failed.as_str(), error, run_id],
        )
        .map_err(StoreError::query)?;

        Ok(())
    }

    async fn get_summary(&self) -> Result<LedgerSummary, StoreError> {
        let conn = self.lock()?;
        let t = &self.tables;

        let total_rows = Self::count(&conn, &format!("SELECT COUNT(*) FROM {}", t.ledger))?;
        let active = Self::count(
            &conn,
            &format!("SELECT COUNT(*) FROM {} WHERE removed_at IS NULL", t.ledger),
        )?;
        let tracks = Self::count(&conn, &format!("SELECT COUNT(*) FROM {}", t.tracks))?;
        let artists = Self::count(&conn, &format!("SELECT COUNT(*) FROM {}", t.artists))?;
        let albums = Self::count(&conn, &format!("SELECT COUNT(*) FROM {}", t.albums))?;

        let last_run: Option<(i64, Option<i64>, String, Option<String>)> = conn
            .query_row(
                &format!(
                    "SELECT started_at, completed_at, status, error FROM {} ORDER BY id DESC LIMIT 1",
                    t.runs
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(StoreError::query)?;

        let (last_run_started, last_run_completed, last_run_status, last_run_error) =
            match last_run {
                Some((started, completed, status, error)) => (
                    Some(from_millis(started)),
                    completed.map(from_millis),
                    RunStatus::from_str(&status),
                    error,
                ),
                None => (None, None, None, None),
            };

        Ok(LedgerSummary {
            total_rows,
            active,
            closed: total_rows - active,
            tracks,
            artists,
            albums,
            last_run_started,
            last_run_completed,
            last_run_status,
            last_run_error,
        })
    }
}

/// Convert a database row to a LedgerRow.
fn row_to_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerRow> {
    Ok(LedgerRow {
        id: row.get(0)?,
        track_id: row.get(1)?,
        artist_id: row.get(2)?,
        album_id: row.get(3)?,
        added_at: from_millis(row.get(4)?),
        removed_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
    })
}

/// Timestamps are stored as Unix milliseconds.
fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}
