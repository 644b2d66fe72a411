//! Diff engine: classifies membership changes between the ledger's active
//! rows and the staged snapshot.

use std::collections::HashMap;

use crate::ledger::LedgerRow;

use super::staging::StagedSnapshot;

/// Membership changes for one cycle.
///
/// `to_add` follows snapshot order; `to_remove` and `unchanged` are sorted by
/// track id. The same inputs always give the same output, which is what makes
/// a retried cycle apply exactly the same changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// In the snapshot, not active in the ledger.
    pub to_add: Vec<String>,
    /// Active in the ledger, absent from the snapshot.
    pub to_remove: Vec<String>,
    /// Present in both; no action.
    pub unchanged: Vec<String>,
}

impl MembershipDiff {
    /// True when the cycle has nothing to write to the ledger.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Compute `staged − active`, `active − staged` and their intersection.
pub fn diff(active: &HashMap<String, LedgerRow>, staged: &StagedSnapshot) -> MembershipDiff {
    let mut to_add = Vec::new();
    let mut unchanged = Vec::new();

    for record in staged.records() {
        if active.contains_key(&record.track_id) {
            unchanged.push(record.track_id.clone());
        } else {
            to_add.push(record.track_id.clone());
        }
    }

    let mut to_remove: Vec<String> = active
        .keys()
        .filter(|track_id| !staged.contains(track_id))
        .cloned()
        .collect();

    to_remove.sort_unstable();
    unchanged.sort_unstable();

    MembershipDiff {
        to_add,
        to_remove,
        unchanged,
    }
}
