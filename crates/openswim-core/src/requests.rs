//! Desired-state requests and their payload parsing.
//!
//! The transport hands over JSON arrays. Each entry is validated on its own:
//! a malformed entry is logged and dropped while the rest of the payload is
//! kept.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::RequestError;

/// A YouTube video that should be in the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRequest {
    /// YouTube video id.
    pub id: String,
    /// Display title.
    pub title: String,
}

/// A playlist and its ordered tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistRequest {
    /// YouTube playlist id.
    pub id: String,
    /// Display title, also used for the device directory name.
    pub title: String,
    /// Tracks in playlist order. Empty means "resolve from the source".
    #[serde(default)]
    pub tracks: Vec<TrackRequest>,
}

/// A podcast episode that should be in the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRequest {
    /// Stable episode identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Publication timestamp; orders episodes on the device.
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub date: DateTime<Utc>,
    /// Direct URL of the episode audio.
    pub download_url: String,
}

/// Per-entry validation beyond what deserialization checks.
pub trait ValidateRequest {
    /// Identifier used for de-duplication.
    fn request_id(&self) -> &str;

    /// Return a reason when the entry must be rejected.
    fn validate(&self) -> std::result::Result<(), String>;
}

impl ValidateRequest for TrackRequest {
    fn request_id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("track id is empty".to_string());
        }
        Ok(())
    }
}

impl ValidateRequest for PlaylistRequest {
    fn request_id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("playlist id is empty".to_string());
        }
        if let Some(pos) = self.tracks.iter().position(|t| t.validate().is_err()) {
            return Err(format!("track {pos} of playlist {} has an empty id", self.id));
        }
        Ok(())
    }
}

impl ValidateRequest for EpisodeRequest {
    fn request_id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("episode id is empty".to_string());
        }
        if self.download_url.trim().is_empty() {
            return Err(format!("episode {} has no download_url", self.id));
        }
        Ok(())
    }
}

/// Validate already-decoded entries, dropping malformed ones.
///
/// A later entry with an identifier seen earlier replaces the earlier one
/// in place.
pub fn collect_valid<T>(entries: Vec<serde_json::Value>) -> Vec<T>
where
    T: DeserializeOwned + ValidateRequest,
{
    let mut accepted: Vec<T> = Vec::with_capacity(entries.len());

    for (index, value) in entries.into_iter().enumerate() {
        let request = match serde_json::from_value::<T>(value) {
            Ok(request) => request,
            Err(e) => {
                let err = RequestError::InvalidEntry {
                    index,
                    reason: e.to_string(),
                };
                warn!("Rejected request: {}", err);
                continue;
            }
        };

        if let Err(reason) = request.validate() {
            let err = RequestError::InvalidEntry { index, reason };
            warn!("Rejected request: {}", err);
            continue;
        }

        if let Some(existing) = accepted
            .iter_mut()
            .find(|r| r.request_id() == request.request_id())
        {
            debug!("Request {} replaces an earlier entry", request.request_id());
            *existing = request;
        } else {
            accepted.push(request);
        }
    }

    accepted
}

/// Accept RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS[.f]` (taken as UTC) or a bare date.
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid date '{raw}'")))
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
