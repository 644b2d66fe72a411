//! Persistent membership ledger and lookup tables.
//!
//! The ledger is an append-only table of membership intervals: a row is
//! opened when a track enters the playlist and closed (soft-deleted) by
//! setting `removed_at` when it leaves. Three insert-if-absent lookup tables
//! map track, artist and album ids to their first-seen names.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{LedgerStore, SqliteLedgerStore};
pub use error::StoreError;
pub use types::{
    CloseOutcome, EntityKind, LedgerRow, LedgerSummary, LookupRow, MembershipRecord,
    OpenOutcome, RawMembershipRow, RunStats, RunStatus, TableNames,
};
