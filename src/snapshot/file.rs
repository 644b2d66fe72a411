//! Snapshot files on local disk.
//!
//! A snapshot file is either a JSON array of row objects (`.json`) or one
//! row object per line (`.jsonl`). Dated files written by `fetch` are named
//! `<prefix>_<YYYYMMDD>.json`; a directory source picks the newest of those
//! for its prefix and ignores every other file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tokio::fs;

use crate::ledger::RawMembershipRow;

use super::{SnapshotError, SnapshotProvider};

/// Reads a snapshot from a file, or the newest dated `<prefix>_<YYYYMMDD>`
/// snapshot in a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotProvider {
    path: PathBuf,
    prefix: String,
}

impl FileSnapshotProvider {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
        }
    }

    async fn resolve(&self) -> Result<PathBuf, SnapshotError> {
        let meta = fs::metadata(&self.path)
            .await
            .map_err(|e| SnapshotError::io(&self.path, e))?;
        if meta.is_dir() {
            latest_snapshot(&self.path, &self.prefix).await
        } else {
            Ok(self.path.clone())
        }
    }
}

#[async_trait]
impl SnapshotProvider for FileSnapshotProvider {
    async fn fetch(&self) -> Result<Vec<RawMembershipRow>, SnapshotError> {
        let path = self.resolve().await?;
        tracing::debug!(path = %path.display(), "Reading snapshot file");
        read_snapshot(&path).await
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// `<prefix>_<YYYYMMDD>.json`
pub fn snapshot_file_name(prefix: &str, date: NaiveDate) -> String {
    format!("{}_{}.json", prefix, date.format("%Y%m%d"))
}

/// Date of a `<prefix>_<YYYYMMDD>.json[l]` file name, `None` for any other name.
pub fn snapshot_date(path: &Path, prefix: &str) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".json")
        .or_else(|| name.strip_suffix(".jsonl"))?;
    let digits = stem.strip_prefix(prefix)?.strip_prefix('_')?;
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

/// Newest dated snapshot for `prefix` in `dir`; every other file is skipped.
pub async fn latest_snapshot(dir: &Path, prefix: &str) -> Result<PathBuf, SnapshotError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| SnapshotError::io(dir, e))?;
    let mut latest: Option<(NaiveDate, PathBuf)> = None;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SnapshotError::io(dir, e))?
    {
        let path = entry.path();
        let Some(date) = snapshot_date(&path, prefix) else {
            tracing::debug!(path = %path.display(), "Skipping non-snapshot file");
            continue;
        };
        let newer = latest
            .as_ref()
            .map_or(true, |(d, p)| (date, path.file_name()) > (*d, p.file_name()));
        if newer {
            latest = Some((date, path));
        }
    }

    latest
        .map(|(_, path)| path)
        .ok_or_else(|| SnapshotError::NoSnapshots(dir.to_path_buf()))
}

/// Read every row of a snapshot file, in file order.
pub async fn read_snapshot(path: &Path) -> Result<Vec<RawMembershipRow>, SnapshotError> {
    let jsonl = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => false,
        Some("jsonl") => true,
        _ => return Err(SnapshotError::UnsupportedFormat(path.display().to_string())),
    };
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| SnapshotError::io(path, e))?;

    if jsonl {
        Ok(parse_json_lines(&text))
    } else {
        parse_json_array(&text).map_err(|e| SnapshotError::json(path, e))
    }
}

fn parse_json_array(text: &str) -> Result<Vec<RawMembershipRow>, serde_json::Error> {
    let entries: Vec<Value> = serde_json::from_str(text)?;
    Ok(entries.iter().map(row_from_value).collect())
}

fn parse_json_lines(text: &str) -> Vec<RawMembershipRow> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| match serde_json::from_str::<Value>(line) {
            Ok(value) => row_from_value(&value),
            Err(e) => {
                tracing::warn!(line = n + 1, error = %e, "Undecodable snapshot line");
                RawMembershipRow::default()
            }
        })
        .collect()
}

/// Decode one entry without failing: strings are taken as is, numbers are
/// stringified, anything else leaves the field empty. A non-object entry
/// becomes an empty row, which staging then drops as malformed.
fn row_from_value(value: &Value) -> RawMembershipRow {
    let Some(obj) = value.as_object() else {
        return RawMembershipRow::default();
    };
    let field = |name: &str| match obj.get(name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    RawMembershipRow {
        track_id: field("track_id"),
        track_name: field("track_name"),
        artist_id: field("artist_id"),
        artist_name: field("artist_name"),
        album_id: field("album_id"),
        album_name: field("album_name"),
        added_at: field("added_at"),
    }
}

/// Write `rows` to `<dir>/<prefix>_<YYYYMMDD>.json`, replacing a file of the
/// same name. Writes to a `.part` file first and renames it into place.
pub async fn write_snapshot(
    dir: &Path,
    prefix: &str,
    date: NaiveDate,
    rows: &[RawMembershipRow],
) -> Result<PathBuf, SnapshotError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| SnapshotError::io(dir, e))?;

    let path = dir.join(snapshot_file_name(prefix, date));
    let part_path = path.with_extension("json.part");
    let body = serde_json::to_vec_pretty(rows).map_err(|e| SnapshotError::json(&path, e))?;

    fs::write(&part_path, body)
        .await
        .map_err(|e| SnapshotError::io(&part_path, e))?;
    fs::rename(&part_path, &path)
        .await
        .map_err(|e| SnapshotError::io(&path, e))?;

    tracing::info!(path = %path.display(), rows = rows.len(), "Wrote snapshot");
    Ok(path)
}
