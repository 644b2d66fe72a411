//! Staging loader: turns raw snapshot rows into the deduplicated "current"
//! membership set.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::ledger::{MembershipRecord, RawMembershipRow};

/// Why a snapshot row could not be staged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("unparseable added_at '{0}'")]
    InvalidTimestamp(String),
}

/// A dropped snapshot row. Recovered locally: counted and logged, never
/// fatal to the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("snapshot row {position} dropped: {reason}")]
pub struct MalformedRow {
    /// Zero-based position of the row in the snapshot.
    pub position: usize,
    pub track_id: Option<String>,
    pub reason: MalformedReason,
}

/// The staged snapshot: at most one record per track id.
#[derive(Debug, Clone, Default)]
pub struct StagedSnapshot {
    /// Records in order of each track's first appearance.
    records: Vec<MembershipRecord>,
    index: HashMap<String, usize>,
    malformed: Vec<MalformedRow>,
}

impl StagedSnapshot {
    pub fn records(&self) -> &[MembershipRecord] {
        &self.records
    }

    pub fn get(&self, track_id: &str) -> Option<&MembershipRecord> {
        self.index.get(track_id).map(|&i| &self.records[i])
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.index.contains_key(track_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn malformed(&self) -> &[MalformedRow] {
        &self.malformed
    }

    pub fn dropped_count(&self) -> u64 {
        self.malformed.len() as u64
    }

    fn insert(&mut self, record: MembershipRecord) {
        match self.index.get(&record.track_id) {
            Some(&i) => {
                tracing::debug!(
                    track_id = %record.track_id,
                    previous_added_at = %self.records[i].added_at,
                    added_at = %record.added_at,
                    "Duplicate track in snapshot, keeping later row"
                );
                self.records[i] = record;
            }
            None => {
                self.index
                    .insert(record.track_id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

/// Stage a snapshot.
///
/// Rows lacking `track_id`, `artist_id`, `album_id` or a parseable
/// `added_at` are dropped and reported. When a track id occurs more than
/// once the later row wins.
pub fn stage<I>(rows: I) -> StagedSnapshot
where
    I: IntoIterator<Item = RawMembershipRow>,
{
    let mut staged = StagedSnapshot::default();

    for (position, row) in rows.into_iter().enumerate() {
        match validate(position, row) {
            Ok(record) => staged.insert(record),
            Err(malformed) => {
                tracing::warn!("{}", malformed);
                staged.malformed.push(malformed);
            }
        }
    }

    tracing::debug!(
        staged = staged.len(),
        dropped = staged.dropped_count(),
        "Staged snapshot"
    );
    staged
}

fn validate(position: usize, row: RawMembershipRow) -> Result<MembershipRecord, MalformedRow> {
    let track_id = non_empty(row.track_id);
    let malformed = |reason| MalformedRow {
        position,
        track_id: track_id.clone(),
        reason,
    };

    let Some(track_id_value) = track_id.clone() else {
        return Err(malformed(MalformedReason::MissingField("track_id")));
    };
    let Some(artist_id) = non_empty(row.artist_id) else {
        return Err(malformed(MalformedReason::MissingField("artist_id")));
    };
    let Some(album_id) = non_empty(row.album_id) else {
        return Err(malformed(MalformedReason::MissingField("album_id")));
    };
    let Some(raw_added_at) = non_empty(row.added_at) else {
        return Err(malformed(MalformedReason::MissingField("added_at")));
    };
    let Some(added_at) = parse_timestamp(raw_added_at.trim()) else {
        return Err(malformed(MalformedReason::InvalidTimestamp(raw_added_at)));
    };

    Ok(MembershipRecord {
        track_id: track_id_value,
        artist_id,
        album_id,
        track_name: row.track_name,
        artist_name: row.artist_name,
        album_name: row.album_name,
        added_at,
    })
}

/// Blank values count as missing; anything else is kept verbatim, since ids
/// are opaque keys.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse an ISO-8601 timestamp.
///
/// Accepts RFC 3339 (`2025-02-25T14:03:11Z`, with or without offset) and a
/// bare `YYYY-MM-DDTHH:MM:SS` / `YYYY-MM-DD HH:MM:SS`, read as UTC. Fractional
/// seconds are kept; the store persists millisecond precision.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    None
}
