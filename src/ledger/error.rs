//! Error types for the ledger store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by [`LedgerStore`](super::LedgerStore) operations.
///
/// None of these are recovered inside a reconciliation cycle: the driver
/// aborts the cycle and reports it as retryable.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open or create the database file.
    #[error("Failed to open ledger database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to create or migrate the schema.
    #[error("Ledger schema migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A read or write statement failed.
    #[error("Ledger query failed: {0}")]
    Query(String),

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Ledger schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// A configured table identifier is not a plain SQL identifier.
    #[error("Invalid table name '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidTableName(String),
}

impl StoreError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
