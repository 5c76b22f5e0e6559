//! Newline-delimited JSON envelopes on stdin and stdout.
//!
//! Each line is an envelope `{"kind": ..., "payload": ...}`.

use openswim_core::{
    EpisodeRequest, Error, PlaylistInfoResponse, PlaylistRequest, ProgressEvent, RequestError,
    Result, collect_valid,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Replace the desired episode set.
    Episodes(Vec<EpisodeRequest>),
    /// Replace the desired playlists.
    Playlists(Vec<PlaylistRequest>),
    /// Run a full pass with the current desired state.
    Sync,
    /// Describe a playlist, given as a bare id or a URL.
    PlaylistInfo(String),
}

impl Command {
    /// Short label for logs and job names.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Episodes(_) => "episodes",
            Self::Playlists(_) => "playlists",
            Self::Sync => "sync",
            Self::PlaylistInfo(_) => "playlist_info",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct PlaylistInfoRequest {
    playlist_id: String,
}

/// One line written to stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Outbound {
    /// A pipeline or device progress event.
    Progress(ProgressEvent),
    /// Answer to a `playlist_info` request.
    PlaylistInfo(PlaylistInfoResponse),
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::Request(RequestError::MalformedPayload {
        reason: reason.into(),
    })
}

fn entries(payload: Value) -> Result<Vec<Value>> {
    match payload {
        Value::Array(entries) => Ok(entries),
        Value::Null => Err(malformed("missing payload")),
        other => Err(malformed(format!("payload must be an array, got {other}"))),
    }
}

/// Decode one line. Blank lines yield `None`.
///
/// # Errors
///
/// Returns `RequestError::MalformedPayload` for lines that are not an
/// envelope, envelopes of an unknown kind, or payloads of the wrong shape.
/// Malformed entries inside a payload are dropped, not reported.
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let envelope: Envelope =
        serde_json::from_str(line).map_err(|e| malformed(format!("bad envelope: {e}")))?;

    let command = match envelope.kind.as_str() {
        "episodes" => Command::Episodes(collect_valid(entries(envelope.payload)?)),
        "playlists" => Command::Playlists(collect_valid(entries(envelope.payload)?)),
        "sync" => Command::Sync,
        "playlist_info" => {
            let request: PlaylistInfoRequest = serde_json::from_value(envelope.payload)
                .map_err(|e| malformed(format!("bad playlist_info payload: {e}")))?;
            Command::PlaylistInfo(request.playlist_id)
        }
        other => return Err(malformed(format!("unknown kind '{other}'"))),
    };
    Ok(Some(command))
}
