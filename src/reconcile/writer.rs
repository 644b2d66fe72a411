//! Ledger writer: soft-closes removed memberships, then appends rows for
//! added ones.

use chrono::{DateTime, Utc};

use crate::ledger::{CloseOutcome, LedgerStore, MembershipRecord, OpenOutcome, StoreError};

use super::staging::StagedSnapshot;

/// Close the active row of every removed track at `reconciled_at`.
///
/// Tracks whose row was already closed (by an earlier, interrupted attempt
/// of this cycle) are logged and counted, not treated as errors.
pub async fn close_removed(
    store: &dyn LedgerStore,
    to_remove: &[String],
    reconciled_at: DateTime<Utc>,
) -> Result<CloseOutcome, StoreError> {
    let outcome = store.close_memberships(to_remove, reconciled_at).await?;

    for track_id in &outcome.already_closed {
        tracing::info!(
            track_id = %track_id,
            "Membership already closed, skipping (concurrent modification)"
        );
    }
    tracing::debug!(
        closed = outcome.closed,
        skipped = outcome.already_closed.len(),
        "Closed removed memberships"
    );
    Ok(outcome)
}

/// Append one active row per added track, using the staged record's
/// artist, album and `added_at`.
pub async fn open_added(
    store: &dyn LedgerStore,
    to_add: &[String],
    staged: &StagedSnapshot,
) -> Result<OpenOutcome, StoreError> {
    let records = added_records(to_add, staged);
    let outcome = store.open_memberships(&records).await?;

    for track_id in &outcome.already_active {
        tracing::info!(
            track_id = %track_id,
            "Membership already active, skipping (concurrent modification)"
        );
    }
    tracing::debug!(
        opened = outcome.opened,
        skipped = outcome.already_active.len(),
        "Opened added memberships"
    );
    Ok(outcome)
}

/// Resolve diff track ids back to their staged records, in diff order.
pub(crate) fn added_records(to_add: &[String], staged: &StagedSnapshot) -> Vec<MembershipRecord> {
    to_add
        .iter()
        .filter_map(|track_id| staged.get(track_id).cloned())
        .collect()
}
