//! Row model shared by the staging loader, the diff engine and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StoreError;

/// One row of a snapshot exactly as the provider decoded it.
///
/// Every field is optional here; the staging loader decides which rows are
/// usable. Unknown fields in snapshot files are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMembershipRow {
    #[serde(default)]
    pub track_id: Option<String>,
    #[serde(default)]
    pub track_name: Option<String>,
    #[serde(default)]
    pub artist_id: Option<String>,
    #[serde(default)]
    pub artist_name: Option<String>,
    #[serde(default)]
    pub album_id: Option<String>,
    #[serde(default)]
    pub album_name: Option<String>,
    /// ISO-8601 timestamp supplied by the upstream source.
    #[serde(default)]
    pub added_at: Option<String>,
}

/// A validated snapshot row: one track currently in the playlist.
///
/// Immutable once staged; discarded after the cycle that staged it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRecord {
    pub track_id: String,
    pub artist_id: String,
    pub album_id: String,
    /// Display names feed the lookup tables only; the ledger stores ids.
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// A persisted membership interval.
///
/// Created when a track enters the playlist and closed exactly once (by
/// setting `removed_at`) when it leaves. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    /// Surrogate key; a track that is removed and re-added gets a new row.
    pub id: i64,
    pub track_id: String,
    pub artist_id: String,
    pub album_id: String,
    pub added_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl LedgerRow {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

/// The three deduplicated lookup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Track,
    Artist,
    Album,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Track, EntityKind::Artist, EntityKind::Album];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Artist => "artist",
            Self::Album => "album",
        }
    }
}

/// An id → name entry in one of the lookup tables.
///
/// Created at most once per id and never updated: the first name seen wins,
/// including the case where the first snapshot carried no name at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRow {
    pub id: String,
    pub name: Option<String>,
}

/// Table identifiers used by the store.
///
/// Identifiers cannot be bound as statement parameters, so they are
/// validated once and then interpolated; all values are always bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub ledger: String,
    pub tracks: String,
    pub artists: String,
    pub albums: String,
    pub runs: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            ledger: "playlist_ledger".to_string(),
            tracks: "tracks".to_string(),
            artists: "artists".to_string(),
            albums: "albums".to_string(),
            runs: "reconcile_runs".to_string(),
        }
    }
}

impl TableNames {
    /// Table holding lookup rows for `kind`.
    pub fn lookup(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Track => &self.tracks,
            EntityKind::Artist => &self.artists,
            EntityKind::Album => &self.albums,
        }
    }

    /// Reject anything that is not a bare identifier, and duplicates.
    pub fn validate(&self) -> Result<(), StoreError> {
        let names = [
            &self.ledger,
            &self.tracks,
            &self.artists,
            &self.albums,
            &self.runs,
        ];
        for name in names {
            if !is_identifier(name) {
                return Err(StoreError::InvalidTableName(name.clone()));
            }
        }
        for (i, a) in names.iter().enumerate() {
            if names[i + 1..].iter().any(|b| a.eq_ignore_ascii_case(b)) {
                return Err(StoreError::InvalidTableName(format!(
                    "{a} (used for more than one table)"
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Result of closing removed memberships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    /// Rows whose `removed_at` was set by this call.
    pub closed: u64,
    /// Tracks that had no active row any more (closed by an earlier attempt).
    pub already_closed: Vec<String>,
}

/// Result of opening added memberships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOutcome {
    /// Rows appended by this call.
    pub opened: u64,
    /// Tracks that already had an active row (opened by an earlier attempt).
    pub already_active: Vec<String>,
}

/// Lifecycle state of a recorded reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Counts persisted with a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub added: u64,
    pub removed: u64,
    pub malformed: u64,
    pub lookups_created: u64,
}

/// Summary of the ledger for `status`.
#[derive(Debug, Clone)]
pub struct LedgerSummary {
    pub total_rows: u64,
    pub active: u64,
    pub closed: u64,
    pub tracks: u64,
    pub artists: u64,
    pub albums: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_completed: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_error: Option<String>,
}
