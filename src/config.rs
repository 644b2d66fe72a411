use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};

use crate::cli::{CycleArgs, SnapshotDirArgs, SpotifyArgs, StoreArgs, SyncArgs};
use crate::ledger::TableNames;
use crate::reconcile::ReconcileOptions;
use crate::retry::RetryConfig;
use crate::types::SnapshotSource;

/// Ledger database and its table identifiers.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub tables: TableNames,
}

impl StoreConfig {
    pub fn from_args(args: StoreArgs) -> anyhow::Result<Self> {
        let tables = TableNames {
            ledger: args.ledger_table,
            tracks: args.tracks_table,
            artists: args.artists_table,
            albums: args.albums_table,
            runs: args.runs_table,
        };
        tables.validate()?;
        Ok(Self {
            db_path: expand_tilde(&args.db),
            tables,
        })
    }
}

pub struct SpotifyConfig {
    pub playlist_id: String,
    pub access_token: Option<String>,
    pub api_base: Option<String>,
}

impl std::fmt::Debug for SpotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyConfig")
            .field("playlist_id", &self.playlist_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl SpotifyConfig {
    pub fn from_args(args: SpotifyArgs) -> Self {
        Self {
            playlist_id: args.playlist_id,
            access_token: args.access_token,
            api_base: args.api_base,
        }
    }

    /// The bearer token, or an error naming where to supply it.
    pub fn require_token(&self) -> anyhow::Result<String> {
        self.access_token.clone().ok_or_else(|| {
            anyhow::anyhow!(
                "No Spotify access token: pass --access-token or set SPOTIFY_ACCESS_TOKEN"
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotDirConfig {
    pub dir: PathBuf,
    pub prefix: String,
}

impl SnapshotDirConfig {
    pub fn from_args(args: SnapshotDirArgs) -> Self {
        Self {
            dir: expand_tilde(&args.snapshot_dir),
            prefix: args.prefix,
        }
    }
}

/// Per-cycle options as given on the command line.
#[derive(Debug, Clone, Copy)]
pub struct CycleConfig {
    pub dry_run: bool,
    /// Fixed close timestamp; `None` means "when the cycle starts".
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl CycleConfig {
    pub fn from_args(args: CycleArgs) -> anyhow::Result<Self> {
        let reconciled_at = args
            .reconciled_at
            .as_deref()
            .map(parse_reconciled_at)
            .transpose()?;
        Ok(Self {
            dry_run: args.dry_run,
            reconciled_at,
        })
    }

    /// Options for a cycle starting now.
    pub fn options(&self) -> ReconcileOptions {
        ReconcileOptions {
            reconciled_at: self.reconciled_at.unwrap_or_else(Utc::now),
            dry_run: self.dry_run,
        }
    }
}

/// Configuration of the `sync` command.
#[derive(Debug)]
pub struct Config {
    pub source: SnapshotSource,
    pub spotify: SpotifyConfig,
    pub snapshots: SnapshotDirConfig,
    pub store: StoreConfig,
    pub cycle: CycleConfig,
    pub watch_with_interval: Option<u64>,
    pub retry: RetryConfig,
}

impl Config {
    pub fn from_cli(args: SyncArgs) -> anyhow::Result<Self> {
        let spotify = SpotifyConfig::from_args(args.spotify);
        if args.source == SnapshotSource::Spotify {
            spotify.require_token()?;
        }
        if args.watch_with_interval == Some(0) {
            anyhow::bail!("--watch-with-interval must be at least 1 second");
        }

        Ok(Self {
            source: args.source,
            spotify,
            snapshots: SnapshotDirConfig::from_args(args.snapshots),
            store: StoreConfig::from_args(args.store)?,
            cycle: CycleConfig::from_args(args.cycle)?,
            watch_with_interval: args.watch_with_interval,
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay_secs: args.retry_delay,
                max_delay_secs: 300,
            },
        })
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Parse the `--reconciled-at` value.
///
/// Accepts an RFC 3339 timestamp, a naive ISO datetime (taken as UTC), an ISO
/// date (midnight UTC) or an interval such as `2d` (two days ago).
pub(crate) fn parse_reconciled_at(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<i64>() {
            return Ok(Utc::now() - chrono::Duration::days(days));
        }
    }
    if let Some(dt) = crate::reconcile::staging::parse_timestamp(s) {
        return Ok(dt);
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive_dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive_dt.and_utc());
        }
    }
    anyhow::bail!(
        "Cannot parse '{}' as a timestamp. Expected RFC 3339 (2025-02-25T06:00:00Z), \
         ISO datetime (2025-02-25T06:00:00), ISO date (2025-02-25) or interval (2d)",
        s
    )
}
