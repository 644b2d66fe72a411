//! Database schema definitions and migrations.

use rusqlite::Connection;

use super::error::StoreError;
use super::types::TableNames;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema DDL for version 1.
///
/// The partial unique index is what makes "at most one active membership per
/// track" hold even if a guarded insert is bypassed.
fn schema_v1(t: &TableNames) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {ledger} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    track_id TEXT NOT NULL,
    artist_id TEXT NOT NULL,
    album_id TEXT NOT NULL,
    added_at INTEGER NOT NULL,
    removed_at INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_{ledger}_active_track
    ON {ledger}(track_id) WHERE removed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_{ledger}_track_id ON {ledger}(track_id);

CREATE TABLE IF NOT EXISTS {tracks} (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT
);

CREATE TABLE IF NOT EXISTS {artists} (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT
);

CREATE TABLE IF NOT EXISTS {albums} (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT
);

CREATE TABLE IF NOT EXISTS {runs} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    added INTEGER DEFAULT 0,
    removed INTEGER DEFAULT 0,
    malformed INTEGER DEFAULT 0,
    lookups_created INTEGER DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'running',
    error TEXT
);
"#,
        ledger = t.ledger,
        tracks = t.tracks,
        artists = t.artists,
        albums = t.albums,
        runs = t.runs,
    )
}

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the schema for the given table set.
///
/// Idempotent. The DDL is re-applied even at the current version because the
/// table names are configuration: a database first used with one set of names
/// may later be opened with another.
pub(crate) fn migrate(conn: &Connection, tables: &TableNames) -> Result<(), StoreError> {
    tables.validate()?;
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    conn.execute_batch(&schema_v1(tables))?;

    if current_version < SCHEMA_VERSION {
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrated ledger schema"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_db_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn, &TableNames::default()).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn, &TableNames::default()).unwrap();
        migrate(&conn, &TableNames::default()).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_unsupported_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let result = migrate(&conn, &TableNames::default());
        assert!(matches!(
            result,
            Err(StoreError::UnsupportedSchemaVersion { .. })
        ));
    }

    #[test]
    fn test_invalid_table_name_rejected_before_ddl() {
        let conn = Connection::open_in_memory().unwrap();
        let tables = TableNames {
            tracks: "tracks(id)".to_string(),
            ..TableNames::default()
        };
        assert!(matches!(
            migrate(&conn, &tables),
            Err(StoreError::InvalidTableName(_))
        ));
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
    }

    #[test]
    fn test_custom_table_names_created() {
        let conn = Connection::open_in_memory().unwrap();
        let tables = TableNames {
            ledger: "cbp_playlist".to_string(),
            ..TableNames::default()
        };
        migrate(&conn, &tables).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cbp_playlist", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_second_active_row_rejected_by_index() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn, &TableNames::default()).unwrap();
        let insert = "INSERT INTO playlist_ledger (track_id, artist_id, album_id, added_at, removed_at) VALUES ('T1', 'A', 'B', 0, ?1)";
        conn.execute(insert, [Option::<i64>::None]).unwrap();
        assert!(conn.execute(insert, [Option::<i64>::None]).is_err());
        // Closed rows for the same track are allowed alongside one active row.
        conn.execute(insert, [Some(10i64)]).unwrap();
    }
}
