//! Snapshot reconciliation engine.
//!
//! One cycle stages a snapshot, diffs it against the ledger's active rows,
//! closes removed memberships, opens added ones and fills the lookup tables.
//! Every write is guarded, so a cycle that is interrupted or delivered twice
//! can simply be run again from the start.

pub mod diff;
pub mod error;
pub mod lookup;
pub mod staging;
pub mod writer;

pub use error::ReconcileError;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::ledger::{LedgerRow, LedgerStore, RawMembershipRow, RunStats, StoreError};

use diff::MembershipDiff;
use lookup::{LookupBatch, LookupCounts};
use staging::StagedSnapshot;

/// Per-cycle parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// Timestamp written to `removed_at` for memberships closed this cycle.
    pub reconciled_at: DateTime<Utc>,
    /// Compute and report the diff without writing anything.
    pub dry_run: bool,
}

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Distinct tracks in the staged snapshot.
    pub staged: u64,
    /// Ledger rows opened.
    pub added: u64,
    /// Ledger rows closed.
    pub removed: u64,
    pub unchanged: u64,
    pub malformed_dropped: u64,
    pub lookups_created: LookupCounts,
    /// Close/open guards that found the change already applied.
    pub already_applied: u64,
    pub dry_run: bool,
}

impl ReconcileSummary {
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.removed > 0 || self.lookups_created.total() > 0
    }

    fn run_stats(&self) -> RunStats {
        RunStats {
            added: self.added,
            removed: self.removed,
            malformed: self.malformed_dropped,
            lookups_created: self.lookups_created.total(),
        }
    }
}

/// Result of one cycle as reported to the trigger layer.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Processed successfully.
    Processed(ReconcileSummary),
    /// Failed; nothing is left half-applied, run the cycle again later.
    RetryLater { reason: String },
}

impl From<Result<ReconcileSummary, ReconcileError>> for CycleOutcome {
    fn from(result: Result<ReconcileSummary, ReconcileError>) -> Self {
        match result {
            Ok(summary) => CycleOutcome::Processed(summary),
            Err(e) => CycleOutcome::RetryLater {
                reason: e.to_string(),
            },
        }
    }
}

/// Reconcile one snapshot against the ledger.
///
/// Order is fixed: stage → fetch active → diff → close → open → lookups. The
/// diff is computed once up front and is not re-read after partial writes.
pub async fn reconcile(
    store: &dyn LedgerStore,
    rows: Vec<RawMembershipRow>,
    options: ReconcileOptions,
) -> Result<ReconcileSummary, StoreError> {
    let staged = staging::stage(rows);
    let active = store.fetch_active().await?;
    let diff = diff::diff(&active, &staged);

    tracing::info!(
        staged = staged.len(),
        active = active.len(),
        to_add = diff.to_add.len(),
        to_remove = diff.to_remove.len(),
        unchanged = diff.unchanged.len(),
        malformed = staged.dropped_count(),
        "Computed membership diff"
    );

    let mut summary = ReconcileSummary {
        staged: staged.len() as u64,
        unchanged: diff.unchanged.len() as u64,
        malformed_dropped: staged.dropped_count(),
        dry_run: options.dry_run,
        ..ReconcileSummary::default()
    };

    if options.dry_run {
        summary.added = diff.to_add.len() as u64;
        summary.removed = diff.to_remove.len() as u64;
        return Ok(summary);
    }

    let closed = writer::close_removed(store, &diff.to_remove, options.reconciled_at).await?;
    let opened = writer::open_added(store, &diff.to_add, &staged).await?;
    let candidates = lookup_candidates(&diff, &staged, &active);
    let lookups = lookup::upsert_lookups(store, &candidates).await?;

    summary.added = opened.opened;
    summary.removed = closed.closed;
    summary.already_applied =
        (closed.already_closed.len() + opened.already_active.len()) as u64;
    summary.lookups_created = lookups;
    Ok(summary)
}

/// Lookup rows for the added tracks, followed by those of unchanged tracks.
///
/// Unchanged tracks are normally already present, so their inserts are
/// no-ops; they are included so that a cycle interrupted between opening
/// ledger rows and writing lookups still converges on the next run. An
/// unchanged record only counts when its artist and album match the active
/// ledger row, otherwise its lookups would reference nothing in the ledger.
fn lookup_candidates(
    diff: &MembershipDiff,
    staged: &StagedSnapshot,
    active: &HashMap<String, LedgerRow>,
) -> LookupBatch {
    let added = writer::added_records(&diff.to_add, staged);
    let unchanged = diff
        .unchanged
        .iter()
        .filter_map(|id| staged.get(id).zip(active.get(id)))
        .filter(|(record, row)| {
            record.artist_id == row.artist_id && record.album_id == row.album_id
        })
        .map(|(record, _)| record);
    LookupBatch::from_records(added.iter().chain(unchanged))
}

/// Run one cycle and record it in the store's run history.
///
/// Dry runs are not recorded.
pub async fn run_cycle(
    store: &dyn LedgerStore,
    rows: Vec<RawMembershipRow>,
    options: ReconcileOptions,
) -> Result<ReconcileSummary, StoreError> {
    if options.dry_run {
        return reconcile(store, rows, options).await;
    }

    let run_id = store.start_run().await?;
    match reconcile(store, rows, options).await {
        Ok(summary) => {
            store.complete_run(run_id, &summary.run_stats()).await?;
            tracing::info!(
                run_id,
                added = summary.added,
                removed = summary.removed,
                malformed = summary.malformed_dropped,
                lookups_created = summary.lookups_created.total(),
                "Reconciliation cycle complete"
            );
            Ok(summary)
        }
        Err(e) => {
            tracing::error!(run_id, error = %e, "Reconciliation cycle failed");
            if let Err(record_err) = store.fail_run(run_id, &e.to_string()).await {
                tracing::warn!(run_id, error = %record_err, "Failed to record failed run");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::ledger::{
        CloseOutcome, EntityKind, LedgerSummary, LookupRow, MembershipRecord, OpenOutcome,
        RunStatus, SqliteLedgerStore,
    };

    fn row(track: &str, artist: (&str, &str), album: (&str, &str), added_at: &str) -> RawMembershipRow {
        RawMembershipRow {
            track_id: Some(track.to_string()),
            track_name: Some(format!("Song {track}")),
            artist_id: Some(artist.0.to_string()),
            artist_name: Some(artist.1.to_string()),
            album_id: Some(album.0.to_string()),
            album_name: Some(album.1.to_string()),
            added_at: Some(added_at.to_string()),
        }
    }

    fn simple(track: &str) -> RawMembershipRow {
        row(
            track,
            (&format!("{track}-artist"), "Artist"),
            (&format!("{track}-album"), "Album"),
            "2025-02-25T12:00:00Z",
        )
    }

    fn options_at(day: u32) -> ReconcileOptions {
        ReconcileOptions {
            reconciled_at: Utc.with_ymd_and_hms(2025, 3, day, 6, 0, 0).unwrap(),
            dry_run: false,
        }
    }

    async fn active_ids(store: &SqliteLedgerStore) -> Vec<String> {
        let mut ids: Vec<String> = store.fetch_active().await.unwrap().into_keys().collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_first_cycle_adds_everything() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        let summary = reconcile(&store, vec![simple("T1"), simple("T2")], options_at(1))
            .await
            .unwrap();

        assert_eq!(summary.added, 2);
        assert_eq!(summary.removed, 0);
        assert_eq!(
            summary.lookups_created,
            LookupCounts {
                tracks: 2,
                artists: 2,
                albums: 2
            }
        );
        assert_eq!(active_ids(&store).await, vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn test_second_identical_cycle_is_noop() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        let snapshot = vec![simple("T1"), simple("T2")];

        reconcile(&store, snapshot.clone(), options_at(1)).await.unwrap();
        let before = store.get_summary().await.unwrap();

        let summary = reconcile(&store, snapshot, options_at(2)).await.unwrap();
        assert!(!summary.has_changes());
        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.already_applied, 0);

        let after = store.get_summary().await.unwrap();
        assert_eq!(before.total_rows, after.total_rows);
        assert_eq!(before.tracks, after.tracks);
    }

    #[tokio::test]
    async fn test_removed_track_closed_once() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        reconcile(&store, vec![simple("T1"), simple("T2")], options_at(1))
            .await
            .unwrap();

        let first = reconcile(&store, vec![simple("T2"), simple("T3")], options_at(2))
            .await
            .unwrap();
        assert_eq!(first.added, 1);
        assert_eq!(first.removed, 1);
        assert_eq!(first.unchanged, 1);

        let closed_at = store.track_history("T1").await.unwrap()[0].removed_at;
        assert_eq!(closed_at, Some(options_at(2).reconciled_at));

        // Same snapshot again, later: T1 keeps its removed_at.
        let second = reconcile(&store, vec![simple("T2"), simple("T3")], options_at(3))
            .await
            .unwrap();
        assert_eq!(second.removed, 0);
        assert_eq!(second.added, 0);
        assert_eq!(
            store.track_history("T1").await.unwrap()[0].removed_at,
            closed_at
        );
        assert_eq!(active_ids(&store).await, vec!["T2", "T3"]);
    }

    #[tokio::test]
    async fn test_readded_track_gets_new_row() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        reconcile(&store, vec![simple("T1")], options_at(1)).await.unwrap();
        reconcile(&store, vec![], options_at(2)).await.unwrap();
        reconcile(&store, vec![simple("T1")], options_at(3)).await.unwrap();

        let history = store.track_history("T1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_active());
        assert!(history[1].is_active());
        // Lookup row was created once.
        assert_eq!(store.get_summary().await.unwrap().tracks, 1);
    }

    #[tokio::test]
    async fn test_at_most_one_active_per_track() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        let snapshots = [
            vec![simple("T1"), simple("T2")],
            vec![simple("T2")],
            vec![simple("T1"), simple("T2"), simple("T1")],
            vec![],
            vec![simple("T1")],
            vec![simple("T1")],
        ];
        for (day, snapshot) in snapshots.into_iter().enumerate() {
            reconcile(&store, snapshot, options_at(day as u32 + 1))
                .await
                .unwrap();
        }

        for track in ["T1", "T2"] {
            let active = store
                .track_history(track)
                .await
                .unwrap()
                .iter()
                .filter(|r| r.is_active())
                .count();
            assert!(active <= 1, "{track} has {active} active rows");
        }
        assert_eq!(store.track_history("T1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_first_seen_name_survives_later_cycle() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        reconcile(
            &store,
            vec![row("T1", ("X", "A"), ("L1", "Album"), "2025-02-25T00:00:00Z")],
            options_at(1),
        )
        .await
        .unwrap();
        reconcile(
            &store,
            vec![row("T2", ("X", "B"), ("L2", "Album 2"), "2025-02-26T00:00:00Z")],
            options_at(2),
        )
        .await
        .unwrap();

        let artist = store
            .get_lookup(EntityKind::Artist, "X")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artist.name.as_deref(), Some("A"));
        assert_eq!(store.get_summary().await.unwrap().artists, 1);
    }

    #[tokio::test]
    async fn test_duplicate_in_snapshot_uses_later_added_at() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        let snapshot = vec![
            row("T9", ("A", "Artist"), ("L", "Album"), "2025-01-01T00:00:00Z"),
            row("T9", ("A", "Artist"), ("L", "Album"), "2025-02-01T00:00:00Z"),
        ];
        let summary = reconcile(&store, snapshot, options_at(1)).await.unwrap();
        assert_eq!(summary.added, 1);

        let history = store.track_history("T9").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].added_at,
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_malformed_rows_counted_not_fatal() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        let mut broken = simple("T4");
        broken.track_id = None;
        let summary = reconcile(
            &store,
            vec![simple("T1"), simple("T2"), broken, simple("T3")],
            options_at(1),
        )
        .await
        .unwrap();
        assert_eq!(summary.malformed_dropped, 1);
        assert_eq!(summary.added, 3);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        let options = ReconcileOptions {
            dry_run: true,
            ..options_at(1)
        };
        let summary = run_cycle(&store, vec![simple("T1")], options).await.unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.added, 1);

        let ledger = store.get_summary().await.unwrap();
        assert_eq!(ledger.total_rows, 0);
        assert!(ledger.last_run_status.is_none());
    }

    #[tokio::test]
    async fn test_interrupted_cycle_converges() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        // A previous attempt opened the ledger row but died before lookups.
        let staged = staging::stage(vec![simple("T1")]);
        store.open_memberships(staged.records()).await.unwrap();

        let summary = reconcile(&store, vec![simple("T1")], options_at(1))
            .await
            .unwrap();
        assert_eq!(summary.added, 0);
        assert_eq!(summary.lookups_created.total(), 3);

        let again = reconcile(&store, vec![simple("T1")], options_at(2))
            .await
            .unwrap();
        assert!(!again.has_changes());
    }

    #[tokio::test]
    async fn test_unchanged_track_with_new_artist_adds_no_lookup() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        reconcile(
            &store,
            vec![row("T1", ("A1", "First"), ("L1", "Album"), "2025-02-25T00:00:00Z")],
            options_at(1),
        )
        .await
        .unwrap();

        // Same track, now credited to another artist; the ledger row keeps A1.
        let summary = reconcile(
            &store,
            vec![row("T1", ("A2", "Second"), ("L1", "Album"), "2025-02-25T00:00:00Z")],
            options_at(2),
        )
        .await
        .unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.lookups_created.total(), 0);
        assert!(store
            .get_lookup(EntityKind::Artist, "A2")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.fetch_active().await.unwrap()["T1"].artist_id, "A1");
    }

    #[tokio::test]
    async fn test_run_cycle_records_success() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        run_cycle(&store, vec![simple("T1")], options_at(1))
            .await
            .unwrap();
        let summary = store.get_summary().await.unwrap();
        assert_eq!(summary.last_run_status, Some(RunStatus::Succeeded));
    }

    /// Delegates to SQLite but fails every `open_memberships` call while armed.
    struct FlakyStore {
        inner: SqliteLedgerStore,
        fail_open: AtomicBool,
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        async fn fetch_active(&self) -> Result<HashMap<String, LedgerRow>, StoreError> {
            self.inner.fetch_active().await
        }
        async fn close_memberships(
            &self,
            track_ids: &[String],
            removed_at: DateTime<Utc>,
        ) -> Result<CloseOutcome, StoreError> {
            self.inner.close_memberships(track_ids, removed_at).await
        }
        async fn open_memberships(
            &self,
            records: &[MembershipRecord],
        ) -> Result<OpenOutcome, StoreError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(StoreError::Query("connection reset".to_string()));
            }
            self.inner.open_memberships(records).await
        }
        async fn insert_lookups_if_absent(
            &self,
            kind: EntityKind,
            rows: &[LookupRow],
        ) -> Result<u64, StoreError> {
            self.inner.insert_lookups_if_absent(kind, rows).await
        }
        async fn get_lookup(
            &self,
            kind: EntityKind,
            id: &str,
        ) -> Result<Option<LookupRow>, StoreError> {
            self.inner.get_lookup(kind, id).await
        }
        async fn track_history(&self, track_id: &str) -> Result<Vec<LedgerRow>, StoreError> {
            self.inner.track_history(track_id).await
        }
        async fn start_run(&self) -> Result<i64, StoreError> {
            self.inner.start_run().await
        }
        async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StoreError> {
            self.inner.complete_run(run_id, stats).await
        }
        async fn fail_run(&self, run_id: i64, error: &str) -> Result<(), StoreError> {
            self.inner.fail_run(run_id, error).await
        }
        async fn get_summary(&self) -> Result<LedgerSummary, StoreError> {
            self.inner.get_summary().await
        }
    }

    #[tokio::test]
    async fn test_store_error_aborts_and_retry_converges() {
        let store = FlakyStore {
            inner: SqliteLedgerStore::open_in_memory().unwrap(),
            fail_open: AtomicBool::new(false),
        };
        run_cycle(&store, vec![simple("T1"), simple("T2")], options_at(1))
            .await
            .unwrap();

        // T1 removed, T3 added; the open step fails after T1 was closed.
        store.fail_open.store(true, Ordering::SeqCst);
        let snapshot = vec![simple("T2"), simple("T3")];
        let result = run_cycle(&store, snapshot.clone(), options_at(2)).await;
        let outcome = CycleOutcome::from(result.map_err(ReconcileError::from));
        assert!(matches!(outcome, CycleOutcome::RetryLater { .. }));
        assert_eq!(
            store.get_summary().await.unwrap().last_run_status,
            Some(RunStatus::Failed)
        );

        // Full retry: T1 is already closed, T3 gets opened.
        store.fail_open.store(false, Ordering::SeqCst);
        let summary = run_cycle(&store, snapshot, options_at(2)).await.unwrap();
        assert_eq!(summary.removed, 0);
        assert_eq!(summary.added, 1);
        assert_eq!(active_ids(&store.inner).await, vec!["T2", "T3"]);
        assert_eq!(
            store.get_summary().await.unwrap().last_run_status,
            Some(RunStatus::Succeeded)
        );
    }
}
