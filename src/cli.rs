use clap::{Args, Parser, Subcommand};

use crate::types::{LogLevel, SnapshotSource};

#[derive(Parser, Debug)]
#[command(
    name = "playlist-ledger",
    version,
    about = "Reconcile playlist snapshots into a soft-delete membership ledger"
)]
pub struct Cli {
    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch the playlist from Spotify and store a dated snapshot file
    Fetch(FetchArgs),
    /// Reconcile one snapshot file (or the newest in a directory) into the ledger
    Reconcile(ReconcileArgs),
    /// Fetch and reconcile, optionally on an interval
    Sync(SyncArgs),
    /// Show ledger counts and the last run
    Status(StatusArgs),
    /// Show every membership interval of one track
    History(HistoryArgs),
}

/// Ledger database location and table identifiers.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Path to the ledger SQLite database
    #[arg(long, env = "PLAYLIST_LEDGER_DB", default_value = "~/.playlist-ledger/ledger.db")]
    pub db: String,

    /// Ledger table name
    #[arg(long, default_value = "playlist_ledger")]
    pub ledger_table: String,

    /// Tracks lookup table name
    #[arg(long, default_value = "tracks")]
    pub tracks_table: String,

    /// Artists lookup table name
    #[arg(long, default_value = "artists")]
    pub artists_table: String,

    /// Albums lookup table name
    #[arg(long, default_value = "albums")]
    pub albums_table: String,

    /// Reconciliation run history table name
    #[arg(long, default_value = "reconcile_runs")]
    pub runs_table: String,
}

/// Spotify playlist source.
#[derive(Args, Debug, Clone)]
pub struct SpotifyArgs {
    /// Playlist to snapshot
    #[arg(long, default_value = "0A7njjO6LMimV1ce46gLJw")]
    pub playlist_id: String,

    /// Bearer token for the Web API (not refreshed by this tool)
    #[arg(long, env = "SPOTIFY_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Web API base URL
    #[arg(long)]
    pub api_base: Option<String>,
}

/// Where dated snapshot files live.
#[derive(Args, Debug, Clone)]
pub struct SnapshotDirArgs {
    /// Directory for `<prefix>_<YYYYMMDD>.json` snapshot files
    #[arg(long, default_value = "~/.playlist-ledger/snapshots")]
    pub snapshot_dir: String,

    /// File name prefix for stored snapshots
    #[arg(long, default_value = "playlist_items")]
    pub prefix: String,
}

/// Options shared by every command that runs a reconciliation cycle.
#[derive(Args, Debug, Clone)]
pub struct CycleArgs {
    /// Report the diff without writing to the ledger
    #[arg(long)]
    pub dry_run: bool,

    /// Timestamp recorded on closed memberships (ISO date or datetime, UTC).
    /// Defaults to the time the cycle starts.
    #[arg(long)]
    pub reconciled_at: Option<String>,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    #[command(flatten)]
    pub spotify: SpotifyArgs,

    #[command(flatten)]
    pub snapshots: SnapshotDirArgs,
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Snapshot file (.json or .jsonl) or a directory of snapshot files
    #[arg(long)]
    pub snapshot: Option<String>,

    #[command(flatten)]
    pub snapshots: SnapshotDirArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub cycle: CycleArgs,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Snapshot source for each cycle
    #[arg(long, value_enum, default_value = "spotify")]
    pub source: SnapshotSource,

    #[command(flatten)]
    pub spotify: SpotifyArgs,

    #[command(flatten)]
    pub snapshots: SnapshotDirArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub cycle: CycleArgs,

    /// Run continuously, waiting N seconds between cycles
    #[arg(long)]
    pub watch_with_interval: Option<u64>,

    /// Max retries of a failed cycle (0 = no retries)
    #[arg(long, default_value = "2")]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value = "5")]
    pub retry_delay: u64,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Track id to show
    pub track_id: String,

    #[command(flatten)]
    pub store: StoreArgs,
}
