//! Snapshot providers: where the raw membership rows of one cycle come from.

pub mod error;
pub mod file;
pub mod spotify;

use async_trait::async_trait;

use crate::ledger::RawMembershipRow;

pub use error::SnapshotError;
pub use file::FileSnapshotProvider;
pub use spotify::SpotifyPlaylistProvider;

/// A source of one full playlist snapshot, in playlist order.
///
/// Rows are returned as decoded; validation happens at staging.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RawMembershipRow>, SnapshotError>;

    /// Human-readable source, for logs.
    fn describe(&self) -> String;
}
