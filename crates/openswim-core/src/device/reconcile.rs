//! Converging the device to the desired collections.
//!
//! Each desired collection maps to one directory at the device root, and no
//! two collections share one. The ledger remembers the content hash of what was copied, so unchanged
//! collections cost no writes at all. Collections that left the desired
//! set are deleted from the device.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::device::ledger::{CollectionKind, DeviceCollectionEntry, DeviceSyncState, content_hash};
use crate::error::{DeviceError, Error, Result, copy_error, create_dir_error, delete_error};
use crate::library::{
    EpisodeRecord, EpisodeStatus, LibraryCollection, LibraryStore, TrackRecord, TrackStatus,
};
use crate::progress::{ProgressEvent, ProgressReporter, ProgressStatus, SyncPhase};
use crate::requests::{EpisodeRequest, PlaylistRequest};
use crate::sanitize::sanitize_name;

/// Ledger id of the podcast collection.
pub const PODCAST_COLLECTION_ID: &str = "podcasts";

/// Device directory holding podcast segments.
pub const PODCAST_DIRECTORY: &str = "podcast";

/// A collection as it should exist on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredCollection {
    /// Collection identifier.
    pub id: String,
    /// What the collection mirrors.
    pub kind: CollectionKind,
    /// Display title.
    pub title: String,
    /// Directory name at the device root.
    pub directory: String,
    /// Member identifiers in device order.
    pub members: Vec<String>,
}

impl DesiredCollection {
    /// Collection for a playlist.
    ///
    /// `track_ids` are in request order; the device gets the newest
    /// `limit` of them, newest first.
    #[must_use]
    pub fn playlist<I, S>(playlist: &PlaylistRequest, track_ids: I, limit: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: DoubleEndedIterator,
        S: Into<String>,
    {
        let fallback = sanitize_name(&playlist.id, "playlist");
        Self {
            id: playlist.id.clone(),
            kind: CollectionKind::Playlist,
            title: playlist.title.clone(),
            directory: sanitize_name(&playlist.title, &fallback),
            members: track_ids
                .into_iter()
                .rev()
                .take(limit)
                .map(Into::into)
                .collect(),
        }
    }

    /// Collection for the podcast episode set, oldest episode first.
    #[must_use]
    pub fn podcasts(episodes: &[EpisodeRequest]) -> Self {
        let mut ordered: Vec<&EpisodeRequest> = episodes.iter().collect();
        ordered.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Self {
            id: PODCAST_COLLECTION_ID.to_string(),
            kind: CollectionKind::Podcasts,
            title: "Podcasts".to_string(),
            directory: PODCAST_DIRECTORY.to_string(),
            members: ordered.into_iter().map(|e| e.id.clone()).collect(),
        }
    }

    /// Hash of the ordered member identifiers.
    #[must_use]
    pub fn content_hash(&self) -> String {
        content_hash(&self.members)
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Collections removed from the device.
    pub removed: Vec<String>,
    /// Collections left untouched.
    pub skipped: Vec<String>,
    /// Collections rewritten.
    pub synced: Vec<String>,
    /// Collections that failed.
    pub failed: Vec<String>,
    /// Files copied in total.
    pub files_copied: usize,
    /// Members that could not be copied.
    pub members_skipped: usize,
    /// Whether the ledger document was rewritten.
    pub ledger_written: bool,
}

impl ReconcileReport {
    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} synced, {} skipped, {} removed, {} failed ({} files copied, {} members skipped)",
            self.synced.len(),
            self.skipped.len(),
            self.removed.len(),
            self.failed.len(),
            self.files_copied,
            self.members_skipped
        )
    }
}

/// Result of rewriting one collection directory.
struct CopyOutcome {
    members_copied: usize,
    files_copied: usize,
    members_skipped: usize,
}

const fn phase_for(kind: CollectionKind) -> SyncPhase {
    match kind {
        CollectionKind::Playlist => SyncPhase::DeviceYoutube,
        CollectionKind::Podcasts => SyncPhase::DevicePodcast,
    }
}

/// Applies desired collections to a mounted device.
pub struct DeviceReconciler<'a> {
    device_root: &'a Path,
    store: &'a LibraryStore,
    reporter: &'a dyn ProgressReporter,
}

impl<'a> DeviceReconciler<'a> {
    /// Create a reconciler for the device mounted at `device_root`.
    #[must_use]
    pub const fn new(
        device_root: &'a Path,
        store: &'a LibraryStore,
        reporter: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            device_root,
            store,
            reporter,
        }
    }

    /// Converge the device to `desired`.
    ///
    /// Collection-level failures are reported and recorded in the report;
    /// only problems with the device itself or the ledger are returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the device root is not a directory, the library
    /// or ledger cannot be read, or the ledger cannot be written.
    pub fn reconcile(&self, desired: &[DesiredCollection]) -> Result<ReconcileReport> {
        if !self.device_root.is_dir() {
            return Err(Error::Device(DeviceError::NotFound {
                name: self.device_root.display().to_string(),
            }));
        }

        info!(
            "Reconciling {} collections on {}",
            desired.len(),
            self.device_root.display()
        );

        let original = DeviceSyncState::load(self.device_root)?;
        let mut ledger = original.clone();
        let tracks = self.store.load_tracks()?;
        let episodes = self.store.load_episodes()?;
        let mut report = ReconcileReport::default();

        let desired = assign_directories(desired, &original);
        let claimed: HashSet<String> = desired
            .iter()
            .map(|c| directory_key(&c.directory))
            .collect();
        let shared = shared_directories(&original);

        // Stale removal
        let wanted: HashSet<&str> = desired.iter().map(|c| c.id.as_str()).collect();
        for entry in &original.collections {
            if wanted.contains(entry.id.as_str()) {
                continue;
            }
            let phase = phase_for(entry.kind);
            let removal = if claimed.contains(&directory_key(&entry.directory)) {
                debug!(
                    "Stale collection {} shares {} with a wanted collection, keeping the directory",
                    entry.id, entry.directory
                );
                Ok(())
            } else {
                self.remove_directory(&entry.directory)
            };
            match removal {
                Ok(()) => {
                    info!("Removed stale collection {} ({})", entry.id, entry.directory);
                    ledger.remove(&entry.id);
                    report.removed.push(entry.id.clone());
                    self.reporter.report(
                        ProgressEvent::new(phase, ProgressStatus::Completed)
                            .with_collection(&entry.id, &entry.directory)
                            .with_message("removed from device"),
                    );
                }
                Err(e) => {
                    error!("Could not remove stale collection {}: {}", entry.id, e);
                    report.failed.push(entry.id.clone());
                    self.reporter.report(
                        ProgressEvent::new(phase, ProgressStatus::Error)
                            .with_collection(&entry.id, &entry.directory)
                            .with_message(e.to_string()),
                    );
                }
            }
        }

        for collection in &desired {
            let phase = phase_for(collection.kind);
            let hash = collection.content_hash();
            let previous = ledger.entry(&collection.id).cloned();

            if let Some(entry) = &previous
                && entry.content_hash == hash
                && entry.directory == collection.directory
                && entry.item_count == collection.members.len()
                && !shared.contains(&directory_key(&entry.directory))
                && self.device_root.join(&entry.directory).is_dir()
            {
                debug!("Collection {} unchanged, skipping", collection.id);
                report.skipped.push(collection.id.clone());
                self.reporter.report(
                    ProgressEvent::new(phase, ProgressStatus::Skipped)
                        .with_collection(&collection.id, &collection.title)
                        .with_message("unchanged"),
                );
                continue;
            }

            self.reporter.report(
                ProgressEvent::new(phase, ProgressStatus::Started)
                    .with_collection(&collection.id, &collection.title)
                    .with_counts(0, collection.members.len()),
            );

            match self.rewrite_collection(
                collection,
                previous.as_ref(),
                &claimed,
                &tracks,
                &episodes,
            ) {
                Ok(outcome) => {
                    ledger.upsert(DeviceCollectionEntry {
                        id: collection.id.clone(),
                        kind: collection.kind,
                        directory: collection.directory.clone(),
                        content_hash: hash,
                        item_count: outcome.members_copied,
                    });
                    report.synced.push(collection.id.clone());
                    report.files_copied += outcome.files_copied;
                    report.members_skipped += outcome.members_skipped;
                    info!(
                        "Collection {}: {}/{} members copied",
                        collection.id,
                        outcome.members_copied,
                        collection.members.len()
                    );
                    self.reporter.report(
                        ProgressEvent::new(phase, ProgressStatus::Completed)
                            .with_collection(&collection.id, &collection.title)
                            .with_counts(outcome.members_copied, collection.members.len()),
                    );
                }
                Err(e) => {
                    error!("Collection {} failed: {}", collection.id, e);
                    ledger.remove(&collection.id);
                    report.failed.push(collection.id.clone());
                    self.reporter.report(
                        ProgressEvent::new(phase, ProgressStatus::Error)
                            .with_collection(&collection.id, &collection.title)
                            .with_message(e.to_string()),
                    );
                }
            }
        }

        if ledger != original {
            ledger.save(self.device_root)?;
            report.ledger_written = true;
        }

        info!("Device reconciliation: {}", report.summary());
        Ok(report)
    }

    fn rewrite_collection(
        &self,
        collection: &DesiredCollection,
        previous: Option<&DeviceCollectionEntry>,
        claimed: &HashSet<String>,
        tracks: &LibraryCollection<TrackRecord>,
        episodes: &LibraryCollection<EpisodeRecord>,
    ) -> Result<CopyOutcome> {
        // The old directory may now belong to another collection
        if let Some(entry) = previous
            && entry.directory != collection.directory
            && !claimed.contains(&directory_key(&entry.directory))
        {
            self.remove_directory(&entry.directory)?;
        }
        self.remove_directory(&collection.directory)?;
        let target = self.device_root.join(&collection.directory);
        fs::create_dir_all(&target).map_err(|e| create_dir_error(&target, &e))?;

        let phase = phase_for(collection.kind);
        let total = collection.members.len();
        let mut outcome = CopyOutcome {
            members_copied: 0,
            files_copied: 0,
            members_skipped: 0,
        };

        for (index, member_id) in collection.members.iter().enumerate() {
            let (title, files) = match collection.kind {
                CollectionKind::Playlist => track_artifact(tracks, member_id),
                CollectionKind::Podcasts => episode_artifacts(episodes, member_id),
            };
            let event = |status: ProgressStatus| {
                ProgressEvent::new(phase, status)
                    .with_collection(&collection.id, &collection.title)
                    .with_item(member_id, &title)
                    .with_counts(index + 1, total)
            };

            let files = match files {
                Ok(files) => files,
                Err(reason) => {
                    warn!("Skipping {} in {}: {}", member_id, collection.id, reason);
                    outcome.members_skipped += 1;
                    self.reporter
                        .report(event(ProgressStatus::Skipped).with_message(reason));
                    continue;
                }
            };

            self.reporter.report(event(ProgressStatus::Copying));
            let mut complete = true;
            for file in &files {
                match copy_to_directory(file, &target) {
                    Ok(()) => outcome.files_copied += 1,
                    Err(e) => {
                        error!("Copy failed for {}: {}", member_id, e);
                        complete = false;
                        self.reporter
                            .report(event(ProgressStatus::Error).with_message(e.to_string()));
                        break;
                    }
                }
            }
            if complete {
                outcome.members_copied += 1;
            } else {
                outcome.members_skipped += 1;
            }
        }

        Ok(outcome)
    }

    /// Remove a collection directory at the device root, if present.
    fn remove_directory(&self, directory: &str) -> Result<()> {
        let path = self.collection_path(directory)?;
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|e| delete_error(&path, &e))?;
            debug!("Removed {}", path.display());
        }
        Ok(())
    }

    /// Join a ledger directory name onto the device root, refusing anything
    /// that is not a single plain path component.
    fn collection_path(&self, directory: &str) -> Result<PathBuf> {
        let mut components = Path::new(directory).components();
        match (components.next(), components.next()) {
            (Some(std::path::Component::Normal(name)), None) => Ok(self.device_root.join(name)),
            _ => Err(Error::Configuration(format!(
                "Refusing to touch device path '{directory}'"
            ))),
        }
    }
}

/// Directory names compare case-insensitively, as on FAT volumes.
fn directory_key(directory: &str) -> String {
    directory.to_lowercase()
}

/// Directories the ledger records for more than one collection.
fn shared_directories(ledger: &DeviceSyncState) -> HashSet<String> {
    let mut seen = HashSet::new();
    ledger
        .collections
        .iter()
        .map(|entry| directory_key(&entry.directory))
        .filter(|key| !seen.insert(key.clone()))
        .collect()
}

/// Give every collection a device directory of its own.
///
/// The podcast directory is reserved for the podcast collection. A
/// collection whose preferred directory is already recorded for it in the
/// ledger keeps it; remaining clashes get the collection id appended.
fn assign_directories(
    desired: &[DesiredCollection],
    ledger: &DeviceSyncState,
) -> Vec<DesiredCollection> {
    let mut taken = HashSet::from([directory_key(PODCAST_DIRECTORY)]);
    let mut podcast_claimed = false;
    let mut assigned: Vec<Option<String>> = vec![None; desired.len()];

    for (slot, collection) in assigned.iter_mut().zip(desired) {
        if collection.kind == CollectionKind::Podcasts
            && collection.directory == PODCAST_DIRECTORY
            && !podcast_claimed
        {
            podcast_claimed = true;
            *slot = Some(collection.directory.clone());
            continue;
        }
        let recorded = ledger
            .entry(&collection.id)
            .is_some_and(|entry| entry.directory == collection.directory);
        if recorded && taken.insert(directory_key(&collection.directory)) {
            *slot = Some(collection.directory.clone());
        }
    }

    desired
        .iter()
        .zip(assigned)
        .map(|(collection, slot)| {
            let directory = slot.unwrap_or_else(|| unique_directory(collection, &mut taken));
            if directory != collection.directory {
                warn!(
                    "Collection {} wants directory {}, already in use; using {}",
                    collection.id, collection.directory, directory
                );
            }
            DesiredCollection {
                directory,
                ..collection.clone()
            }
        })
        .collect()
}

fn unique_directory(collection: &DesiredCollection, taken: &mut HashSet<String>) -> String {
    if taken.insert(directory_key(&collection.directory)) {
        return collection.directory.clone();
    }
    let base = format!(
        "{}_{}",
        collection.directory,
        sanitize_name(&collection.id, "collection")
    );
    let mut candidate = base.clone();
    let mut counter = 2;
    while !taken.insert(directory_key(&candidate)) {
        candidate = format!("{base}_{counter}");
        counter += 1;
    }
    candidate
}

fn track_artifact(
    tracks: &LibraryCollection<TrackRecord>,
    id: &str,
) -> (String, std::result::Result<Vec<PathBuf>, String>) {
    let Some(record) = tracks.get(id) else {
        return (id.to_string(), Err("not found in library".to_string()));
    };
    let files = if record.status == TrackStatus::Ready {
        match &record.mp3_path {
            Some(path) if path.is_file() => Ok(vec![path.clone()]),
            Some(path) => Err(format!("artifact missing: {}", path.display())),
            None => Err("no artifact path".to_string()),
        }
    } else {
        Err(format!("not ready ({})", record.status))
    };
    (record.title.clone(), files)
}

fn episode_artifacts(
    episodes: &LibraryCollection<EpisodeRecord>,
    id: &str,
) -> (String, std::result::Result<Vec<PathBuf>, String>) {
    let Some(record) = episodes.get(id) else {
        return (id.to_string(), Err("not found in library".to_string()));
    };
    let files = if record.status == EpisodeStatus::Ready {
        match &record.episode_dir {
            Some(dir) => {
                let segments = record.segment_files();
                if segments.is_empty() {
                    Err(format!("artifact missing: {}", dir.display()))
                } else {
                    Ok(segments)
                }
            }
            None => Err("no artifact path".to_string()),
        }
    } else {
        Err(format!("not ready ({})", record.status))
    };
    (record.title.clone(), files)
}

/// Copy `file` into `dir`, keeping its modification time.
fn copy_to_directory(file: &Path, dir: &Path) -> Result<()> {
    let Some(name) = file.file_name() else {
        return Err(Error::Configuration(format!(
            "Not a file path: {}",
            file.display()
        )));
    };
    let dest = dir.join(name);
    fs::copy(file, &dest).map_err(|e| copy_error(file, &dest, &e))?;

    match fs::metadata(file) {
        Ok(meta) => {
            let mtime = FileTime::from_last_modification_time(&meta);
            if let Err(e) = filetime::set_file_mtime(&dest, mtime) {
                debug!("Could not preserve mtime of {}: {}", dest.display(), e);
            }
        }
        Err(e) => debug!("Could not stat {}: {}", file.display(), e),
    }
    Ok(())
}
