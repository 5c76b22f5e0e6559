//! Playlist lookups for clients choosing what to sync.
//!
//! These run next to the sync queue, not in it: a lookup reads nothing from
//! the library and writes nothing.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::media::tools::MediaTools;
use crate::requests::TrackRequest;

/// Answer to a playlist lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistInfoResponse {
    /// Whether the playlist could be listed.
    pub success: bool,
    /// Playlist identifier, when one could be read from the input.
    pub playlist_id: Option<String>,
    /// Playlist title.
    pub title: Option<String>,
    /// Videos in playlist order.
    #[serde(default)]
    pub videos: Vec<TrackRequest>,
    /// Failure description.
    pub error: Option<String>,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
}

impl PlaylistInfoResponse {
    fn failure(playlist_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            playlist_id,
            title: None,
            videos: Vec::new(),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Read a playlist id from a bare id or a playlist URL.
///
/// URLs must carry a non-empty `list` query parameter.
#[must_use]
pub fn playlist_id_from_input(input: &str) -> Option<String> {
    let raw = input.trim();
    if raw.is_empty() {
        return None;
    }
    if !(raw.starts_with("http://") || raw.starts_with("https://")) {
        return Some(raw.to_string());
    }

    let url = Url::parse(raw).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "list")
        .map(|(_, value)| value.into_owned())
        .filter(|id| !id.is_empty())
}

/// List the playlist named by `input`. Failures become unsuccessful responses.
pub fn lookup_playlist(tools: &dyn MediaTools, input: &str) -> PlaylistInfoResponse {
    let Some(playlist_id) = playlist_id_from_input(input) else {
        warn!("Playlist lookup without a usable id: '{}'", input);
        let reason = format!("no playlist id in '{}'", input.trim());
        return PlaylistInfoResponse::failure(None, reason);
    };

    match tools.list_playlist(&playlist_id) {
        Ok(listing) => {
            info!(
                "Looked up playlist {} ({} videos)",
                listing.id,
                listing.tracks.len()
            );
            PlaylistInfoResponse {
                success: true,
                playlist_id: Some(listing.id),
                title: Some(listing.title),
                videos: listing.tracks,
                error: None,
                timestamp: Utc::now(),
            }
        }
        Err(e) => {
            warn!("Playlist lookup for {} failed: {}", playlist_id, e);
            PlaylistInfoResponse::failure(Some(playlist_id), e.to_string())
        }
    }
}
