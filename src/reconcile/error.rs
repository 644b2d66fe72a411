use thiserror::Error;

use crate::ledger::StoreError;
use crate::snapshot::SnapshotError;

/// Failure of a whole reconciliation cycle (fetch + reconcile).
///
/// Malformed snapshot rows and concurrent-modification no-ops never show up
/// here; both are handled inside the cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Ledger store error: {0}")]
    Store(#[from] StoreError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl ReconcileError {
    /// Whether re-running the full cycle may succeed.
    ///
    /// Store failures are retried because every mutation in a cycle is
    /// idempotent. Configuration problems (bad table names, a newer schema)
    /// and snapshot fetch failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(StoreError::InvalidTableName(_))
            | ReconcileError::Store(StoreError::UnsupportedSchemaVersion { .. }) => false,
            ReconcileError::Store(_) => true,
            ReconcileError::Snapshot(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_retryable() {
        let e = ReconcileError::from(StoreError::Query("database is locked".into()));
        assert!(e.is_retryable());
    }

    #[test]
    fn test_invalid_table_not_retryable() {
        let e = ReconcileError::from(StoreError::InvalidTableName("x y".into()));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_newer_schema_not_retryable() {
        let e = ReconcileError::from(StoreError::UnsupportedSchemaVersion {
            found: 9,
            expected: 1,
        });
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_snapshot_error_not_retryable() {
        let e = ReconcileError::from(SnapshotError::UnsupportedFormat("snap.csv".into()));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_truncated_pagination_not_retryable() {
        let e = ReconcileError::from(SnapshotError::PaginationLimit { pages: 1000 });
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("1000 pages"));
    }
}
