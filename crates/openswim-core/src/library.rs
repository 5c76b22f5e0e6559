//! Local media library: item records and their persistence.
//!
//! Two independent collections are kept, one per [`LibraryDomain`]:
//! tracks under `<library>/youtube/info.json` and episodes under
//! `<library>/podcasts/info.json`. The desired-state request lists live
//! next to them. Records are upserted and never deleted.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::document::{load_document_or_default, save_document};
use crate::error::Result;
use crate::requests::{EpisodeRequest, PlaylistRequest, collect_valid, parse_timestamp};

/// Current library document schema version.
pub const LIBRARY_SCHEMA_VERSION: u32 = 1;

/// Library document file name inside each domain directory.
pub const LIBRARY_DOCUMENT: &str = "info.json";

const PLAYLIST_REQUESTS_DOCUMENT: &str = "playlists_to_sync.json";
const EPISODE_REQUESTS_DOCUMENT: &str = "episodes_to_sync.json";

const fn default_schema_version() -> u32 {
    LIBRARY_SCHEMA_VERSION
}

// =============================================================================
// Status
// =============================================================================

/// Pipeline state of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    /// Known but not processed yet.
    #[default]
    Pending,
    /// Fetching the source audio.
    Downloading,
    /// Loudness normalization.
    Normalizing,
    /// Prepending the spoken title.
    AddingIntro,
    /// Finished artifact is in the library.
    Ready,
    /// Last attempt failed.
    Error,
}

impl TrackStatus {
    /// Persisted name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Normalizing => "normalizing",
            Self::AddingIntro => "adding_intro",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "normalizing" => Some(Self::Normalizing),
            "adding_intro" => Some(Self::AddingIntro),
            "ready" => Some(Self::Ready),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Pipeline state of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    /// Known but not processed yet.
    #[default]
    Pending,
    /// Fetching the episode audio.
    Downloading,
    /// Splitting into segments and adding intros.
    Segmenting,
    /// Segments are in the library.
    Ready,
    /// Last attempt failed.
    Error,
}

impl EpisodeStatus {
    /// Persisted name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Segmenting => "segmenting",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "segmenting" => Some(Self::Segmenting),
            "ready" => Some(Self::Ready),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

// Unknown status strings read as Pending so the item is simply reprocessed.
macro_rules! lenient_status_deserialize {
    ($ty:ty) => {
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(d)?;
                Ok(Self::parse(&raw).unwrap_or_else(|| {
                    warn!("Unknown status '{}', treating as pending", raw);
                    Self::Pending
                }))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

lenient_status_deserialize!(TrackStatus);
lenient_status_deserialize!(EpisodeStatus);

// =============================================================================
// Records
// =============================================================================

/// Anything stored in a [`LibraryCollection`].
pub trait LibraryRecord {
    /// Stable identifier the record is keyed by.
    fn id(&self) -> &str;
}

/// Library view of one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    /// YouTube video id.
    pub id: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Pipeline state.
    #[serde(default)]
    pub status: TrackStatus,
    /// Finished artifact, present only when ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mp3_path: Option<PathBuf>,
    /// Playlists the track was requested by, in first-seen order.
    #[serde(default)]
    pub playlist_ids: Vec<String>,
    /// Diagnostic of the last failure, present only in error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TrackRecord {
    /// Create a pending record.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: TrackStatus::Pending,
            mp3_path: None,
            playlist_ids: Vec::new(),
            error_message: None,
        }
    }

    /// Associate the track with a playlist. Returns `true` if it was new.
    pub fn add_playlist(&mut self, playlist_id: &str) -> bool {
        if self.playlist_ids.iter().any(|p| p == playlist_id) {
            return false;
        }
        self.playlist_ids.push(playlist_id.to_string());
        true
    }

    /// Ready and the artifact still exists on disk.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == TrackStatus::Ready && self.mp3_path.as_deref().is_some_and(Path::is_file)
    }
}

impl LibraryRecord for TrackRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Library view of one podcast episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// Episode identifier.
    pub id: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Publication timestamp.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_timestamp"
    )]
    pub date: Option<DateTime<Utc>>,
    /// Pipeline state.
    #[serde(default)]
    pub status: EpisodeStatus,
    /// Directory holding the finished segments, present only when ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_dir: Option<PathBuf>,
    /// Number of finished segments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_count: Option<usize>,
    /// Diagnostic of the last failure, present only in error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EpisodeRecord {
    /// Create a pending record.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            date: Some(date),
            status: EpisodeStatus::Pending,
            episode_dir: None,
            segment_count: None,
            error_message: None,
        }
    }

    /// Ready and the episode directory still holds its segments.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == EpisodeStatus::Ready
            && self.episode_dir.as_deref().is_some_and(Path::is_dir)
            && !self.segment_files().is_empty()
    }

    /// Finished segment files, sorted by name.
    #[must_use]
    pub fn segment_files(&self) -> Vec<PathBuf> {
        self.episode_dir
            .as_deref()
            .map(list_mp3_files)
            .unwrap_or_default()
    }
}

impl LibraryRecord for EpisodeRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// `*.mp3` files directly inside `dir`, sorted by file name.
#[must_use]
pub fn list_mp3_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| {
            p.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
        })
        .collect();
    files.sort();
    files
}

// =============================================================================
// Collections
// =============================================================================

/// One persisted id-to-record mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "StoredCollection<R>",
    bound(deserialize = "R: Deserialize<'de>")
)]
pub struct LibraryCollection<R> {
    /// Document schema version.
    pub schema_version: u32,
    /// Records keyed by identifier.
    pub items: BTreeMap<String, R>,
}

/// On-disk form. Older documents keep records under `videos` or `episodes`.
#[derive(Deserialize)]
struct StoredCollection<R> {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(default = "BTreeMap::new")]
    items: BTreeMap<String, R>,
    #[serde(default = "BTreeMap::new")]
    videos: BTreeMap<String, R>,
    #[serde(default = "BTreeMap::new")]
    episodes: BTreeMap<String, R>,
}

impl<R> From<StoredCollection<R>> for LibraryCollection<R> {
    fn from(stored: StoredCollection<R>) -> Self {
        let mut items = stored.videos;
        items.extend(stored.episodes);
        if !items.is_empty() && !stored.items.is_empty() {
            warn!(
                "Library document has both items and legacy record keys, merging ({} legacy, {} current)",
                items.len(),
                stored.items.len()
            );
        }
        // Current entries win over legacy ones
        items.extend(stored.items);
        Self {
            schema_version: stored.schema_version,
            items,
        }
    }
}

impl<R> Default for LibraryCollection<R> {
    fn default() -> Self {
        Self {
            schema_version: LIBRARY_SCHEMA_VERSION,
            items: BTreeMap::new(),
        }
    }
}

impl<R: LibraryRecord> LibraryCollection<R> {
    /// Look up a record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&R> {
        self.items.get(id)
    }

    /// Insert or replace a record.
    pub fn upsert(&mut self, record: R) {
        self.items.insert(record.id().to_string(), record);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A library collection type: where it lives and what it holds.
pub trait LibraryDomain {
    /// Record type.
    type Record: LibraryRecord + Serialize + DeserializeOwned + Clone;
    /// Directory under the library root.
    const DIRECTORY: &'static str;
}

/// The track collection.
#[derive(Debug, Clone, Copy)]
pub struct Tracks;

impl LibraryDomain for Tracks {
    type Record = TrackRecord;
    const DIRECTORY: &'static str = "youtube";
}

/// The episode collection.
#[derive(Debug, Clone, Copy)]
pub struct Episodes;

impl LibraryDomain for Episodes {
    type Record = EpisodeRecord;
    const DIRECTORY: &'static str = "podcasts";
}

// =============================================================================
// Store
// =============================================================================

/// Durable storage of library collections and desired-state lists.
#[derive(Debug, Clone)]
pub struct LibraryStore {
    root: PathBuf,
}

impl LibraryStore {
    /// Create a store rooted at `root`. Nothing is touched on disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Library root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a domain, where its artifacts and document live.
    #[must_use]
    pub fn domain_dir<D: LibraryDomain>(&self) -> PathBuf {
        self.root.join(D::DIRECTORY)
    }

    fn document_path<D: LibraryDomain>(&self) -> PathBuf {
        self.domain_dir::<D>().join(LIBRARY_DOCUMENT)
    }

    /// Load a collection. Missing or corrupt documents yield an empty collection.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the document exists but cannot be read.
    pub fn load<D: LibraryDomain>(&self) -> Result<LibraryCollection<D::Record>> {
        let path = self.document_path::<D>();
        let collection: LibraryCollection<D::Record> = load_document_or_default(&path)?;
        if collection.schema_version > LIBRARY_SCHEMA_VERSION {
            warn!(
                "{} has schema version {} (newer than {}), reading known fields only",
                path.display(),
                collection.schema_version,
                LIBRARY_SCHEMA_VERSION
            );
        }
        Ok(collection)
    }

    /// Replace a collection document as a whole.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the document cannot be written.
    pub fn save<D: LibraryDomain>(&self, collection: &LibraryCollection<D::Record>) -> Result<()> {
        let mut doc = collection.clone();
        doc.schema_version = LIBRARY_SCHEMA_VERSION;
        save_document(&self.document_path::<D>(), &doc)
    }

    /// Read-modify-write a single record.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the document cannot be read or written.
    pub fn upsert<D: LibraryDomain>(&self, record: &D::Record) -> Result<()> {
        let mut collection = self.load::<D>()?;
        collection.upsert(record.clone());
        self.save::<D>(&collection)?;
        debug!("Persisted record {} in {}", record.id(), D::DIRECTORY);
        Ok(())
    }

    /// Load the track collection.
    ///
    /// # Errors
    ///
    /// See [`LibraryStore::load`].
    pub fn load_tracks(&self) -> Result<LibraryCollection<TrackRecord>> {
        self.load::<Tracks>()
    }

    /// Save the track collection.
    ///
    /// # Errors
    ///
    /// See [`LibraryStore::save`].
    pub fn save_tracks(&self, collection: &LibraryCollection<TrackRecord>) -> Result<()> {
        self.save::<Tracks>(collection)
    }

    /// Load the episode collection.
    ///
    /// # Errors
    ///
    /// See [`LibraryStore::load`].
    pub fn load_episodes(&self) -> Result<LibraryCollection<EpisodeRecord>> {
        self.load::<Episodes>()
    }

    /// Save the episode collection.
    ///
    /// # Errors
    ///
    /// See [`LibraryStore::save`].
    pub fn save_episodes(&self, collection: &LibraryCollection<EpisodeRecord>) -> Result<()> {
        self.save::<Episodes>(collection)
    }

    // -------------------------------------------------------------------------
    // Desired state
    // -------------------------------------------------------------------------

    /// Load the persisted playlist requests.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the document exists but cannot be read.
    pub fn load_playlist_requests(&self) -> Result<Vec<PlaylistRequest>> {
        let path = self.domain_dir::<Tracks>().join(PLAYLIST_REQUESTS_DOCUMENT);
        let entries: Vec<serde_json::Value> = load_document_or_default(&path)?;
        Ok(collect_valid(entries))
    }

    /// Replace the persisted playlist requests.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the document cannot be written.
    pub fn save_playlist_requests(&self, requests: &[PlaylistRequest]) -> Result<()> {
        let path = self.domain_dir::<Tracks>().join(PLAYLIST_REQUESTS_DOCUMENT);
        save_document(&path, &requests)
    }

    /// Load the persisted episode requests.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the document exists but cannot be read.
    pub fn load_episode_requests(&self) -> Result<Vec<EpisodeRequest>> {
        let path = self.domain_dir::<Episodes>().join(EPISODE_REQUESTS_DOCUMENT);
        let entries: Vec<serde_json::Value> = load_document_or_default(&path)?;
        Ok(collect_valid(entries))
    }

    /// Replace the persisted episode requests.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the document cannot be written.
    pub fn save_episode_requests(&self, requests: &[EpisodeRequest]) -> Result<()> {
        let path = self.domain_dir::<Episodes>().join(EPISODE_REQUESTS_DOCUMENT);
        save_document(&path, &requests)
    }
}
