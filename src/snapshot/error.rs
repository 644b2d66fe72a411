use std::path::PathBuf;

use thiserror::Error;

/// Failures while obtaining a snapshot.
///
/// Individual bad rows are not errors; they reach staging as incomplete
/// rows and are dropped there.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid snapshot JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Unsupported snapshot file: {0} (expected .json or .jsonl)")]
    UnsupportedFormat(String),

    #[error("No snapshot files found in {0}")]
    NoSnapshots(PathBuf),

    /// Raised instead of returning a truncated snapshot.
    #[error("Stopped after {pages} pages without reaching the end of the playlist")]
    PaginationLimit { pages: usize },
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}
