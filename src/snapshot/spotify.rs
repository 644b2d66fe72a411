//! Spotify Web API playlist snapshot.
//!
//! Pages through `GET /v1/playlists/{id}/tracks`, following `next` until it is
//! null. Only the first listed artist of each track is kept. The bearer token
//! is supplied by the caller; it is never refreshed here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;

use crate::ledger::RawMembershipRow;

use super::{SnapshotError, SnapshotProvider};

pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1";

/// A `next` chain longer than this is treated as a failed fetch.
const MAX_PAGES: usize = 1000;

#[derive(Debug, Deserialize)]
struct PlaylistPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    #[serde(default)]
    added_at: Option<String>,
    /// Null for tracks that are no longer available.
    #[serde(default)]
    track: Option<Track>,
}

#[derive(Debug, Deserialize)]
struct Track {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    artists: Vec<NamedRef>,
    #[serde(default)]
    album: Option<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl From<PlaylistItem> for RawMembershipRow {
    fn from(item: PlaylistItem) -> Self {
        let mut row = RawMembershipRow {
            added_at: item.added_at,
            ..RawMembershipRow::default()
        };
        if let Some(track) = item.track {
            row.track_id = track.id;
            row.track_name = track.name;
            if let Some(artist) = track.artists.into_iter().next() {
                row.artist_id = artist.id;
                row.artist_name = artist.name;
            }
            if let Some(album) = track.album {
                row.album_id = album.id;
                row.album_name = album.name;
            }
        }
        row
    }
}

/// Fetches the current membership of one playlist.
pub struct SpotifyPlaylistProvider {
    client: Client,
    access_token: String,
    playlist_id: String,
    api_base: String,
    max_pages: usize,
}

impl SpotifyPlaylistProvider {
    pub fn new(
        access_token: String,
        playlist_id: String,
        api_base: Option<String>,
    ) -> Result<Self, SnapshotError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("playlist-ledger/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            access_token,
            playlist_id,
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            max_pages: MAX_PAGES,
        })
    }

    #[cfg(test)]
    fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    fn first_page_url(&self) -> String {
        format!("{}/playlists/{}/tracks", self.api_base, self.playlist_id)
    }

    async fn get_page(&self, url: &str) -> Result<PlaylistPage, SnapshotError> {
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json::<PlaylistPage>().await?)
    }
}

#[async_trait]
impl SnapshotProvider for SpotifyPlaylistProvider {
    async fn fetch(&self) -> Result<Vec<RawMembershipRow>, SnapshotError> {
        let mut rows = Vec::new();
        let mut next = Some(self.first_page_url());
        let mut pages = 0usize;

        while let Some(url) = next {
            if pages == self.max_pages {
                tracing::warn!(pages, "Playlist pagination did not terminate");
                return Err(SnapshotError::PaginationLimit { pages });
            }
            let page = self.get_page(&url).await?;
            pages += 1;
            tracing::debug!(page = pages, items = page.items.len(), "Fetched playlist page");
            rows.extend(page.items.into_iter().map(RawMembershipRow::from));
            next = page.next;
        }

        tracing::info!(
            playlist_id = %self.playlist_id,
            pages,
            rows = rows.len(),
            "Fetched playlist snapshot"
        );
        Ok(rows)
    }

    fn describe(&self) -> String {
        format!("spotify playlist {}", self.playlist_id)
    }
}
