//! Lookup upserter: insert-if-absent rows for the tracks, artists and albums
//! referenced by a cycle.

use std::collections::HashSet;

use crate::ledger::{EntityKind, LedgerStore, LookupRow, MembershipRecord, StoreError};

/// Distinct lookup rows per table, first occurrence of each id kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupBatch {
    pub tracks: Vec<LookupRow>,
    pub artists: Vec<LookupRow>,
    pub albums: Vec<LookupRow>,
}

impl LookupBatch {
    /// Collect the lookup rows implied by `records`, in order.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a MembershipRecord>,
    {
        let mut batch = Self::default();
        let mut seen: [HashSet<String>; 3] = Default::default();

        for record in records {
            let entries = [
                (&record.track_id, &record.track_name, &mut batch.tracks),
                (&record.artist_id, &record.artist_name, &mut batch.artists),
                (&record.album_id, &record.album_name, &mut batch.albums),
            ];
            for ((id, name, rows), seen) in entries.into_iter().zip(seen.iter_mut()) {
                if seen.insert(id.clone()) {
                    rows.push(LookupRow {
                        id: id.clone(),
                        name: name.clone(),
                    });
                }
            }
        }
        batch
    }

    pub fn rows(&self, kind: EntityKind) -> &[LookupRow] {
        match kind {
            EntityKind::Track => &self.tracks,
            EntityKind::Artist => &self.artists,
            EntityKind::Album => &self.albums,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty() && self.artists.is_empty() && self.albums.is_empty()
    }
}

/// Lookup rows created per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupCounts {
    pub tracks: u64,
    pub artists: u64,
    pub albums: u64,
}

impl LookupCounts {
    pub fn total(&self) -> u64 {
        self.tracks + self.artists + self.albums
    }

    fn set(&mut self, kind: EntityKind, value: u64) {
        match kind {
            EntityKind::Track => self.tracks = value,
            EntityKind::Artist => self.artists = value,
            EntityKind::Album => self.albums = value,
        }
    }
}

/// Insert every row of `batch` whose id is not already present.
///
/// Ids that exist keep their stored name. Re-running with the same batch
/// creates nothing.
pub async fn upsert_lookups(
    store: &dyn LedgerStore,
    batch: &LookupBatch,
) -> Result<LookupCounts, StoreError> {
    let mut counts = LookupCounts::default();

    for kind in EntityKind::ALL {
        let rows = batch.rows(kind);
        let created = store.insert_lookups_if_absent(kind, rows).await?;
        let existing = rows.len() as u64 - created;
        if existing > 0 {
            tracing::debug!(
                kind = kind.as_str(),
                existing,
                "Lookup ids already present, names kept"
            );
        }
        counts.set(kind, created);
    }

    tracing::debug!(
        tracks = counts.tracks,
        artists = counts.artists,
        albums = counts.albums,
        "Upserted lookup rows"
    );
    Ok(counts)
}
