//! playlist-ledger: reconcile periodic playlist snapshots into a historical
//! membership ledger.
//!
//! Each cycle takes one full snapshot of a playlist and brings the ledger in
//! line with it. Tracks that left the playlist get their open interval closed
//! (soft delete). Tracks that entered get a new interval. Track, artist and
//! album names land in insert-if-absent lookup tables. Every write is guarded,
//! so a failed or repeated cycle is safe to run again.

#![warn(clippy::all)]

mod cli;
mod config;
mod ledger;
mod reconcile;
pub mod retry;
mod shutdown;
mod snapshot;
mod types;

use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::{CycleConfig, SnapshotDirConfig, SpotifyConfig, StoreConfig};
use ledger::{LedgerStore, SqliteLedgerStore};
use reconcile::{CycleOutcome, ReconcileError, ReconcileSummary};
use snapshot::{FileSnapshotProvider, SnapshotProvider, SpotifyPlaylistProvider};
use types::SnapshotSource;

/// Open (creating if needed) the ledger database.
async fn open_store(store: &StoreConfig) -> anyhow::Result<SqliteLedgerStore> {
    if let Some(parent) = store.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let db = SqliteLedgerStore::open(&store.db_path, store.tables.clone()).await?;
    tracing::debug!(path = %db.path().display(), "Ledger database opened");
    Ok(db)
}

fn spotify_provider(spotify: &SpotifyConfig) -> anyhow::Result<SpotifyPlaylistProvider> {
    Ok(SpotifyPlaylistProvider::new(
        spotify.require_token()?,
        spotify.playlist_id.clone(),
        spotify.api_base.clone(),
    )?)
}

fn print_summary(summary: &ReconcileSummary) {
    if summary.dry_run {
        println!("Dry run, nothing written:");
    } else {
        println!("Reconciled:");
    }
    println!("  Staged:            {}", summary.staged);
    println!("  Added:             {}", summary.added);
    println!("  Removed:           {}", summary.removed);
    println!("  Unchanged:         {}", summary.unchanged);
    println!("  Malformed dropped: {}", summary.malformed_dropped);
    if !summary.dry_run {
        let lookups = &summary.lookups_created;
        println!(
            "  Lookups created:   {} tracks, {} artists, {} albums",
            lookups.tracks, lookups.artists, lookups.albums
        );
        if summary.already_applied > 0 {
            println!("  Already applied:   {}", summary.already_applied);
        }
    }
}

/// Run the fetch command.
async fn run_fetch(args: cli::FetchArgs) -> anyhow::Result<()> {
    let spotify = SpotifyConfig::from_args(args.spotify);
    let snapshots = SnapshotDirConfig::from_args(args.snapshots);
    let provider = spotify_provider(&spotify)?;

    let rows = provider.fetch().await?;
    let path = snapshot::file::write_snapshot(
        &snapshots.dir,
        &snapshots.prefix,
        Utc::now().date_naive(),
        &rows,
    )
    .await?;
    println!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

/// Run the reconcile command against a stored snapshot.
async fn run_reconcile(args: cli::ReconcileArgs) -> anyhow::Result<()> {
    let store_config = StoreConfig::from_args(args.store)?;
    let cycle = CycleConfig::from_args(args.cycle)?;
    let snapshots = SnapshotDirConfig::from_args(args.snapshots);
    let source: PathBuf = match args.snapshot {
        Some(path) => config::expand_tilde(&path),
        None => snapshots.dir,
    };
    let provider = FileSnapshotProvider::new(source, snapshots.prefix);
    let store = open_store(&store_config).await?;

    let outcome = CycleOutcome::from(reconcile_once(&store, &provider, None, cycle).await);
    match outcome {
        CycleOutcome::Processed(summary) => {
            print_summary(&summary);
            Ok(())
        }
        CycleOutcome::RetryLater { reason } => {
            anyhow::bail!("Reconciliation failed, safe to retry: {}", reason)
        }
    }
}

/// One full cycle: fetch, optionally store the snapshot, reconcile.
async fn reconcile_once(
    store: &dyn LedgerStore,
    provider: &dyn SnapshotProvider,
    archive: Option<&SnapshotDirConfig>,
    cycle: CycleConfig,
) -> Result<ReconcileSummary, ReconcileError> {
    tracing::info!(source = %provider.describe(), "Fetching snapshot");
    let rows = provider.fetch().await?;

    if let Some(archive) = archive.filter(|_| !cycle.dry_run) {
        snapshot::file::write_snapshot(
            &archive.dir,
            &archive.prefix,
            Utc::now().date_naive(),
            &rows,
        )
        .await?;
    }

    Ok(reconcile::run_cycle(store, rows, cycle.options()).await?)
}

/// Run the sync command, once or on an interval.
async fn run_sync(args: cli::SyncArgs) -> anyhow::Result<()> {
    let config = config::Config::from_cli(args)?;
    tracing::info!(
        source = ?config.source,
        db = %config.store.db_path.display(),
        dry_run = config.cycle.dry_run,
        "Starting playlist-ledger sync"
    );

    let store = open_store(&config.store).await?;
    let (provider, archive): (Box<dyn SnapshotProvider>, Option<&SnapshotDirConfig>) =
        match config.source {
            SnapshotSource::Spotify => (
                Box::new(spotify_provider(&config.spotify)?),
                Some(&config.snapshots),
            ),
            SnapshotSource::Directory => (
                Box::new(FileSnapshotProvider::new(
                    config.snapshots.dir.clone(),
                    config.snapshots.prefix.clone(),
                )),
                None,
            ),
        };

    let shutdown_token = shutdown::install_signal_handler()?;

    loop {
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        let result = retry::retry_with_backoff(
            &config.retry,
            &shutdown_token,
            retry::classify_cycle_error,
            || reconcile_once(&store, provider.as_ref(), archive, config.cycle),
        )
        .await;

        match CycleOutcome::from(result) {
            CycleOutcome::Processed(summary) => print_summary(&summary),
            CycleOutcome::RetryLater { reason } => {
                if config.watch_with_interval.is_none() {
                    anyhow::bail!("Reconciliation failed, safe to retry: {}", reason);
                }
                tracing::error!(reason = %reason, "Cycle failed, will retry next interval");
            }
        }

        if let Some(interval) = config.watch_with_interval {
            if shutdown_token.is_cancelled() {
                tracing::info!("Shutdown requested, exiting...");
                break;
            }
            tracing::info!("Waiting {} seconds...", interval);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Shutdown during wait, exiting...");
                    break;
                }
            }
        } else {
            break;
        }
    }

    Ok(())
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let store_config = StoreConfig::from_args(args.store)?;

    if !store_config.db_path.exists() {
        println!("No ledger database found at {}", store_config.db_path.display());
        println!("Run a reconcile or sync first to create the database.");
        return Ok(());
    }

    let store = open_store(&store_config).await?;
    let summary = store.get_summary().await?;

    println!("Ledger Database: {}", store_config.db_path.display());
    println!();
    println!("Memberships:");
    println!("  Total rows: {}", summary.total_rows);
    println!("  Active:     {}", summary.active);
    println!("  Closed:     {}", summary.closed);
    println!();
    println!("Lookups:");
    println!("  Tracks:  {}", summary.tracks);
    println!("  Artists: {}", summary.artists);
    println!("  Albums:  {}", summary.albums);

    if let Some(started) = &summary.last_run_started {
        println!();
        println!(
            "Last run started:    {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_run_completed {
        println!(
            "Last run completed:  {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(status) = summary.last_run_status {
        println!("Last run status:     {}", status.as_str());
    }
    if let Some(error) = &summary.last_run_error {
        println!("Last run error:      {}", error);
    }

    Ok(())
}

/// Run the history command.
async fn run_history(args: cli::HistoryArgs) -> anyhow::Result<()> {
    let store_config = StoreConfig::from_args(args.store)?;
    let store = open_store(&store_config).await?;

    let track = store
        .get_lookup(ledger::EntityKind::Track, &args.track_id)
        .await?;
    let history = store.track_history(&args.track_id).await?;

    if history.is_empty() {
        println!("No membership history for track {}", args.track_id);
        return Ok(());
    }

    match track.and_then(|t| t.name) {
        Some(name) => println!("{} ({}):", args.track_id, name),
        None => println!("{}:", args.track_id),
    }
    for row in &history {
        let removed = row
            .removed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "active".to_string());
        println!(
            "  {}  ->  {}  (artist {}, album {})",
            row.added_at.format("%Y-%m-%d %H:%M:%S UTC"),
            removed,
            row.artist_id,
            row.album_id
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Fetch(args) => run_fetch(args).await,
        Command::Reconcile(args) => run_reconcile(args).await,
        Command::Sync(args) => run_sync(args).await,
        Command::Status(args) => run_status(args).await,
        Command::History(args) => run_history(args).await,
    }
}
