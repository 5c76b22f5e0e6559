//! Integration tests for `OpenSwim` core workflows.
//!
//! These tests run full sync passes against a fake tool set:
//! - Playlist tracks through the pipeline and onto a simulated device
//! - Convergence and order sensitivity of device collections
//! - Failure containment and retry on the next pass
//! - The orchestrator driving real passes
//!
//! Library and device are temporary directories.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use openswim_core::{
    AppConfig, DeviceCollectionEntry, DevicePresence, DeviceSyncState, EpisodeRequest,
    EpisodeStatus, Error, FullSyncPass, LibraryStore, MediaTools, PassReport, PlaylistInfo,
    PlaylistRequest,
    ProgressEvent, ProgressReporter, ProgressStatus, Result, SyncOrchestrator, SyncPhase,
    ToolError, TrackRequest, TrackStatus, content_hash,
};
use tempfile::TempDir;

// =============================================================================
// Test Fixtures and Utilities
// =============================================================================

/// Media tools that write small placeholder files and count calls.
#[derive(Default)]
struct FakeMediaTools {
    downloads: AtomicUsize,
    episode_downloads: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    playlists: Mutex<Vec<(String, Vec<TrackRequest>)>>,
    segments_per_episode: usize,
}

impl FakeMediaTools {
    fn new() -> Self {
        Self {
            segments_per_episode: 2,
            ..Self::default()
        }
    }

    fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    fn check(&self, tool: &str, key: &str) -> Result<()> {
        if self.failing.lock().unwrap().iter().any(|id| key.contains(id.as_str())) {
            return Err(Error::Tool(ToolError::Failed {
                tool: tool.to_string(),
                code: Some(1),
                stderr: format!("simulated failure for {key}"),
            }));
        }
        Ok(())
    }
}

fn touch(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}

impl MediaTools for FakeMediaTools {
    fn download_track(&self, video_id: &str, output: &Path) -> Result<()> {
        self.check("yt-dlp", video_id)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        touch(output, video_id)
    }

    fn list_playlist(&self, playlist_id: &str) -> Result<PlaylistInfo> {
        self.check("yt-dlp", playlist_id)?;
        let tracks = self
            .playlists
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == playlist_id)
            .map(|(_, tracks)| tracks.clone())
            .unwrap_or_default();
        Ok(PlaylistInfo {
            id: playlist_id.to_string(),
            title: playlist_id.to_string(),
            tracks,
        })
    }

    fn download_episode(&self, url: &str, output: &Path) -> Result<()> {
        self.check("http", url)?;
        self.episode_downloads.fetch_add(1, Ordering::SeqCst);
        touch(output, url)
    }

    fn normalize_loudness(&self, input: &Path, output: &Path) -> Result<()> {
        fs::copy(input, output)?;
        Ok(())
    }

    fn synthesize_speech(&self, text: &str, output: &Path) -> Result<()> {
        touch(output, text)
    }

    fn generate_silence(&self, _duration: Duration, output: &Path) -> Result<()> {
        touch(output, "silence")
    }

    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let mut joined = String::new();
        for input in inputs {
            joined.push_str(&fs::read_to_string(input)?);
        }
        touch(output, &joined)
    }

    fn split_into_segments(
        &self,
        _input: &Path,
        _segment_length: Duration,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        (0..self.segments_per_episode)
            .map(|i| {
                let path = output_dir.join(format!("segment_{i:03}.mp3"));
                touch(&path, "segment")?;
                Ok(path)
            })
            .collect()
    }
}

/// Reporter that keeps every event.
#[derive(Default)]
struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    fn take(&self) -> Vec<ProgressEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Library, device, tools and reporter for one scenario.
struct TestFixture {
    library_dir: TempDir,
    device_dir: TempDir,
    store: LibraryStore,
    tools: Arc<FakeMediaTools>,
    reporter: Arc<RecordingReporter>,
    presence: DevicePresence,
}

impl TestFixture {
    fn new() -> Self {
        let library_dir = TempDir::new().unwrap();
        let device_dir = TempDir::new().unwrap();
        let store = LibraryStore::new(library_dir.path());
        let presence = DevicePresence::attached(device_dir.path());
        Self {
            library_dir,
            device_dir,
            store,
            tools: Arc::new(FakeMediaTools::new()),
            reporter: Arc::new(RecordingReporter::default()),
            presence,
        }
    }

    fn device_path(&self) -> &Path {
        self.device_dir.path()
    }

    fn pass(&self) -> FullSyncPass {
        let config = AppConfig {
            library_path: self.library_dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        FullSyncPass::new(
            &config,
            self.tools.clone(),
            self.reporter.clone(),
            Arc::new(self.presence.clone()),
        )
    }

    fn run(&self) -> PassReport {
        self.pass().run_pass().unwrap()
    }

    fn request_playlist(&self, id: &str, title: &str, track_ids: &[&str]) {
        let mut playlists = self.store.load_playlist_requests().unwrap();
        playlists.retain(|p| p.id != id);
        playlists.push(PlaylistRequest {
            id: id.to_string(),
            title: title.to_string(),
            tracks: track_ids
                .iter()
                .map(|t| TrackRequest {
                    id: (*t).to_string(),
                    title: format!("Song {t}"),
                })
                .collect(),
        });
        self.store.save_playlist_requests(&playlists).unwrap();
    }

    fn device_files(&self, dir: &str) -> Vec<String> {
        let path = self.device_path().join(dir);
        if !path.is_dir() {
            return Vec::new();
        }
        let mut names: Vec<String> = fs::read_dir(path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn ledger_entry(&self, id: &str) -> Option<DeviceCollectionEntry> {
        DeviceSyncState::load(self.device_path())
            .unwrap()
            .entry(id)
            .cloned()
    }
}

fn statuses_for(events: &[ProgressEvent], phase: SyncPhase, item: &str) -> Vec<ProgressStatus> {
    events
        .iter()
        .filter(|e| e.phase == phase && e.item_id.as_deref() == Some(item))
        .map(|e| e.status)
        .collect()
}

// =============================================================================
// Example scenario
// =============================================================================

#[test]
fn test_single_track_playlist_end_to_end() {
    let fx = TestFixture::new();
    let store = &fx.store;
    store
        .save_playlist_requests(&[PlaylistRequest {
            id: "p1".to_string(),
            title: "p1".to_string(),
            tracks: vec![TrackRequest {
                id: "v1".to_string(),
                title: "Song A".to_string(),
            }],
        }])
        .unwrap();

    // First pass
    let report = fx.run();
    let events = fx.reporter.take();
    assert_eq!(report.tracks.ready, 1);
    assert_eq!(
        statuses_for(&events, SyncPhase::YoutubeLibrary, "v1"),
        vec![
            ProgressStatus::Started,
            ProgressStatus::Downloading,
            ProgressStatus::Normalizing,
            ProgressStatus::AddingIntro,
            ProgressStatus::Completed,
        ]
    );

    let record = store.load_tracks().unwrap().get("v1").cloned().unwrap();
    assert_eq!(record.status, TrackStatus::Ready);
    let artifact = record.mp3_path.unwrap();
    assert!(artifact.is_file());
    assert_eq!(
        artifact.file_name().unwrap().to_string_lossy(),
        "Song_A__normalized__v1.mp3"
    );

    assert_eq!(fx.device_files("p1"), vec!["Song_A__normalized__v1.mp3"]);
    assert_eq!(
        fx.ledger_entry("p1").unwrap().content_hash,
        content_hash(&["v1"])
    );

    // Second pass
    let ledger_path = DeviceSyncState::path(fx.device_path());
    let ledger_mtime = fs::metadata(&ledger_path).unwrap().modified().unwrap();

    let report = fx.run();
    let events = fx.reporter.take();
    assert_eq!(report.tracks.skipped, 1);
    assert_eq!(
        statuses_for(&events, SyncPhase::YoutubeLibrary, "v1"),
        vec![ProgressStatus::Skipped]
    );
    assert!(events.iter().any(|e| e.phase == SyncPhase::DeviceYoutube
        && e.collection_id.as_deref() == Some("p1")
        && e.status == ProgressStatus::Skipped));

    let device = report.device.unwrap();
    assert_eq!(device.skipped, vec!["p1"]);
    assert_eq!(device.files_copied, 0);
    assert!(!device.ledger_written);
    assert_eq!(fx.tools.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::metadata(&ledger_path).unwrap().modified().unwrap(),
        ledger_mtime
    );
}

// =============================================================================
// Device collections
// =============================================================================

#[test]
fn test_reordered_playlist_is_recopied() {
    let fx = TestFixture::new();
    fx.request_playlist("p1", "Laps", &["a", "b", "c"]);
    fx.run();
    let first = fx.ledger_entry("p1").unwrap();

    fx.request_playlist("p1", "Laps", &["c", "b", "a"]);
    let report = fx.run();

    let device = report.device.unwrap();
    assert_eq!(device.synced, vec!["p1"]);
    assert_eq!(device.files_copied, 3);
    assert_ne!(fx.ledger_entry("p1").unwrap().content_hash, first.content_hash);
    // Tracks themselves were not reprocessed
    assert_eq!(fx.tools.downloads.load(Ordering::SeqCst), 3);
}

#[test]
fn test_dropped_playlist_is_removed_from_device() {
    let fx = TestFixture::new();
    fx.request_playlist("p1", "Warmup", &["a"]);
    fx.request_playlist("p2", "Cooldown", &["b"]);
    fx.run();
    assert_eq!(fx.device_files("Cooldown").len(), 1);

    let mut playlists = fx.store.load_playlist_requests().unwrap();
    playlists.retain(|p| p.id != "p2");
    fx.store.save_playlist_requests(&playlists).unwrap();

    let report = fx.run();
    assert_eq!(report.device.unwrap().removed, vec!["p2"]);
    assert!(!fx.device_path().join("Cooldown").exists());
    assert!(fx.ledger_entry("p2").is_none());
    assert!(fx.ledger_entry("p1").is_some());
}

#[test]
fn test_playlist_is_newest_first_and_limited_on_device() {
    let fx = TestFixture::new();
    let ids: Vec<String> = (0..25).map(|i| format!("t{i:02}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    fx.request_playlist("p1", "Long", &refs);

    fx.run();

    let entry = fx.ledger_entry("p1").unwrap();
    assert_eq!(entry.item_count, 20);
    let expected: Vec<&str> = refs.iter().rev().take(20).copied().collect();
    assert_eq!(entry.content_hash, content_hash(&expected));
    assert_eq!(fx.device_files("Long").len(), 20);
}

#[test]
fn test_resolves_playlist_without_tracks() {
    let fx = TestFixture::new();
    fx.tools.playlists.lock().unwrap().push((
        "PLx".to_string(),
        vec![TrackRequest {
            id: "r1".to_string(),
            title: "Resolved".to_string(),
        }],
    ));
    fx.request_playlist("PLx", "Listed", &[]);

    let report = fx.run();
    assert_eq!(report.tracks.ready, 1);
    assert_eq!(fx.device_files("Listed"), vec!["Resolved__normalized__r1.mp3"]);
}

// =============================================================================
// Failure containment
// =============================================================================

#[test]
fn test_one_failing_track_does_not_stop_the_others() {
    let fx = TestFixture::new();
    let ids: Vec<String> = (0..10).map(|i| format!("v{i}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    fx.request_playlist("p1", "Ten", &refs);
    fx.tools.fail("v4");

    let report = fx.run();
    assert_eq!(report.tracks.ready, 9);
    assert_eq!(report.tracks.failed, 1);

    let tracks = fx.store.load_tracks().unwrap();
    for id in &ids {
        let expected = if id == "v4" {
            TrackStatus::Error
        } else {
            TrackStatus::Ready
        };
        assert_eq!(tracks.get(id).unwrap().status, expected, "track {id}");
    }
    assert!(tracks.get("v4").unwrap().error_message.is_some());
    assert_eq!(fx.device_files("Ten").len(), 9);

    // The next pass retries the failed track and completes the collection
    fx.tools.heal("v4");
    let report = fx.run();
    assert_eq!(report.tracks.ready, 1);
    assert_eq!(report.tracks.skipped, 9);
    assert_eq!(report.device.unwrap().synced, vec!["p1"]);
    assert_eq!(fx.device_files("Ten").len(), 10);
    assert_eq!(fx.ledger_entry("p1").unwrap().item_count, 10);
}

#[test]
fn test_failed_playlist_listing_keeps_device_collection() {
    let fx = TestFixture::new();
    fx.tools.playlists.lock().unwrap().push((
        "PLx".to_string(),
        vec![TrackRequest {
            id: "r1".to_string(),
            title: "Resolved".to_string(),
        }],
    ));
    fx.request_playlist("PLx", "Listed", &[]);
    fx.run();

    fx.tools.fail("PLx");
    let report = fx.run();
    assert_eq!(report.unresolved_playlists, vec!["PLx"]);
    assert_eq!(report.device.unwrap().skipped, vec!["PLx"]);
    assert_eq!(fx.device_files("Listed").len(), 1);
}

// =============================================================================
// Podcasts
// =============================================================================

fn episode(id: &str, day: u32) -> EpisodeRequest {
    EpisodeRequest {
        id: id.to_string(),
        title: format!("Episode {id}"),
        date: Utc.with_ymd_and_hms(2024, 3, day, 6, 0, 0).unwrap(),
        download_url: format!("https://example.com/{id}.mp3"),
    }
}

#[test]
fn test_episodes_are_segmented_and_mirrored() {
    let fx = TestFixture::new();
    fx.store
        .save_episode_requests(&[episode("e2", 9), episode("e1", 2)])
        .unwrap();

    let report = fx.run();
    assert_eq!(report.episodes.ready, 2);

    let episodes = fx.store.load_episodes().unwrap();
    let e1 = episodes.get("e1").unwrap();
    assert_eq!(e1.status, EpisodeStatus::Ready);
    assert_eq!(e1.segment_count, Some(2));
    assert_eq!(
        e1.segment_files()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>(),
        vec!["Episode_e1_e1_001.mp3", "Episode_e1_e1_002.mp3"]
    );

    assert_eq!(fx.device_files("podcast").len(), 4);
    let entry = fx.ledger_entry("podcasts").unwrap();
    assert_eq!(entry.content_hash, content_hash(&["e1", "e2"]));

    // Second pass does nothing
    let report = fx.run();
    assert_eq!(report.episodes.skipped, 2);
    assert_eq!(report.device.unwrap().skipped, vec!["podcasts"]);
    assert_eq!(fx.tools.episode_downloads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failing_episode_is_isolated() {
    let fx = TestFixture::new();
    fx.store
        .save_episode_requests(&[episode("e1", 1), episode("bad", 2), episode("e3", 3)])
        .unwrap();
    fx.tools.fail("bad");

    let report = fx.run();
    assert_eq!(report.episodes.ready, 2);
    assert_eq!(report.episodes.failed, 1);

    let episodes = fx.store.load_episodes().unwrap();
    assert_eq!(episodes.get("bad").unwrap().status, EpisodeStatus::Error);
    assert_eq!(fx.device_files("podcast").len(), 4);
}

// =============================================================================
// Device presence
// =============================================================================

#[test]
fn test_detached_device_is_left_alone() {
    let fx = TestFixture::new();
    fx.presence.set(None);
    fx.request_playlist("p1", "Laps", &["a"]);

    let report = fx.run();
    assert!(report.device.is_none());
    assert_eq!(report.tracks.ready, 1);
    assert!(!DeviceSyncState::path(fx.device_path()).exists());

    // Attaching later mirrors the already-ready track without reprocessing
    fx.presence.set(Some(fx.device_path().to_path_buf()));
    let report = fx.run();
    assert_eq!(report.tracks.skipped, 1);
    assert_eq!(report.device.unwrap().synced, vec!["p1"]);
    assert_eq!(fx.tools.downloads.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Orchestrator
// =============================================================================

#[tokio::test]
async fn test_orchestrator_runs_queued_passes() {
    let fx = TestFixture::new();
    fx.request_playlist("p1", "Laps", &["a", "b"]);

    let (orchestrator, worker) = SyncOrchestrator::new(Arc::new(fx.pass()));
    let worker = tokio::spawn(worker.run());

    let store = fx.store.clone();
    orchestrator.enqueue(
        "add playlist",
        Box::new(move || {
            let mut playlists = store.load_playlist_requests()?;
            playlists.push(PlaylistRequest {
                id: "p2".to_string(),
                title: "Extra".to_string(),
                tracks: vec![TrackRequest {
                    id: "c".to_string(),
                    title: "Song c".to_string(),
                }],
            });
            store.save_playlist_requests(&playlists)
        }),
    );
    assert!(orchestrator.enqueue_full_sync());
    drop(orchestrator);

    let stats = worker.await.unwrap();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(fx.device_files("Laps").len(), 2);
    assert_eq!(fx.device_files("Extra").len(), 1);
}
