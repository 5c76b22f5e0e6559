//! Track pipeline: download, normalize, add the spoken title.

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::library::{TrackRecord, TrackStatus, Tracks};
use crate::media::pipeline::{
    BatchSummary, ItemOutcome, MediaPipeline, Scope, install_file, work_dir,
};
use crate::progress::{ProgressEvent, ProgressStatus, SyncPhase};
use crate::requests::{PlaylistRequest, TrackRequest};
use crate::sanitize::{sanitize_name, track_file_name};

const PHASE: SyncPhase = SyncPhase::YoutubeLibrary;

impl MediaPipeline<'_> {
    /// Make sure a track is ready in the library.
    ///
    /// When `playlist` is given the track is associated with it.
    pub fn ensure_track(
        &self,
        request: &TrackRequest,
        playlist: Option<&PlaylistRequest>,
    ) -> TrackRecord {
        let scope = Scope {
            collection: playlist.map(|p| (p.id.as_str(), p.title.as_str())),
            position: None,
        };
        self.ensure_track_in(request, scope).0
    }

    /// Ensure every track of a playlist, in order.
    pub fn sync_playlist(
        &self,
        playlist: &PlaylistRequest,
        tracks: &[TrackRequest],
    ) -> BatchSummary {
        info!(
            "Syncing playlist '{}' ({} tracks)",
            playlist.title,
            tracks.len()
        );
        self.reporter.report(
            ProgressEvent::new(PHASE, ProgressStatus::Started)
                .with_collection(&playlist.id, &playlist.title)
                .with_counts(0, tracks.len()),
        );

        let mut summary = BatchSummary::default();
        for (index, track) in tracks.iter().enumerate() {
            let scope = Scope {
                collection: Some((playlist.id.as_str(), playlist.title.as_str())),
                position: Some((index + 1, tracks.len())),
            };
            let (_, outcome) = self.ensure_track_in(track, scope);
            summary.record(outcome);
        }

        self.reporter.report(
            ProgressEvent::new(PHASE, ProgressStatus::Completed)
                .with_collection(&playlist.id, &playlist.title)
                .with_counts(tracks.len(), tracks.len())
                .with_message(summary.summary()),
        );
        info!("Playlist '{}': {}", playlist.title, summary.summary());
        summary
    }

    pub(crate) fn ensure_track_in(
        &self,
        request: &TrackRequest,
        scope: Scope<'_>,
    ) -> (TrackRecord, ItemOutcome) {
        let existing = match self.store.load_tracks() {
            Ok(tracks) => tracks.get(&request.id).cloned(),
            Err(e) => {
                warn!("Could not read track library: {}", e);
                None
            }
        };
        let is_new = existing.is_none();
        let mut record = existing.unwrap_or_else(|| TrackRecord::new(&request.id, &request.title));
        let associated = scope
            .collection
            .is_some_and(|(playlist_id, _)| record.add_playlist(playlist_id));

        if record.is_available() {
            if associated {
                self.persist_quietly::<Tracks>(&record);
            }
            debug!("Track {} already ready, skipping", record.id);
            self.emit(
                PHASE,
                ProgressStatus::Skipped,
                (&record.id, &record.title),
                scope,
                None,
            );
            return (record, ItemOutcome::Skipped);
        }

        record.title.clone_from(&request.title);
        if is_new {
            self.persist_quietly::<Tracks>(&record);
        }
        self.emit(
            PHASE,
            ProgressStatus::Started,
            (&record.id, &record.title),
            scope,
            None,
        );

        match self.process_track(&mut record, scope) {
            Ok(()) => {
                info!("Track {} ready", record.id);
                self.emit(
                    PHASE,
                    ProgressStatus::Completed,
                    (&record.id, &record.title),
                    scope,
                    None,
                );
                (record, ItemOutcome::Ready)
            }
            Err(e) => {
                error!("Track {} failed: {}", record.id, e);
                record.status = TrackStatus::Error;
                record.mp3_path = None;
                record.error_message = Some(e.to_string());
                self.persist_quietly::<Tracks>(&record);
                self.emit(
                    PHASE,
                    ProgressStatus::Error,
                    (&record.id, &record.title),
                    scope,
                    Some(e.to_string()),
                );
                (record, ItemOutcome::Failed)
            }
        }
    }

    fn process_track(&self, record: &mut TrackRecord, scope: Scope<'_>) -> Result<()> {
        let workdir = work_dir(&record.id)?;
        let stem = sanitize_name(&record.id, "track");
        let downloaded = workdir.path().join(format!("{stem}_source.mp3"));
        let normalized = workdir.path().join(format!("{stem}_normalized.mp3"));
        let intro = workdir.path().join(format!("{stem}_intro.mp3"));
        let silence = workdir.path().join(format!("{stem}_silence.mp3"));
        let finished = workdir.path().join(format!("{stem}_final.mp3"));

        self.advance_track(record, TrackStatus::Downloading, ProgressStatus::Downloading, scope)?;
        self.tools.download_track(&record.id, &downloaded)?;

        self.advance_track(record, TrackStatus::Normalizing, ProgressStatus::Normalizing, scope)?;
        self.tools.normalize_loudness(&downloaded, &normalized)?;

        self.advance_track(record, TrackStatus::AddingIntro, ProgressStatus::AddingIntro, scope)?;
        self.tools.synthesize_speech(&record.title, &intro)?;
        self.tools
            .generate_silence(self.config.silence_gap(), &silence)?;
        self.tools
            .concatenate(&[intro, silence, normalized], &finished)?;

        let destination = self
            .store
            .domain_dir::<Tracks>()
            .join(track_file_name(&record.title, &record.id));
        install_file(&finished, &destination)?;

        record.status = TrackStatus::Ready;
        record.mp3_path = Some(destination);
        record.error_message = None;
        self.store.upsert::<Tracks>(record)
    }

    fn advance_track(
        &self,
        record: &mut TrackRecord,
        status: TrackStatus,
        progress: ProgressStatus,
        scope: Scope<'_>,
    ) -> Result<()> {
        record.status = status;
        record.mp3_path = None;
        record.error_message = None;
        self.store.upsert::<Tracks>(record)?;
        self.emit(PHASE, progress, (&record.id, &record.title), scope, None);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::{Error, ToolError};
    use crate::library::LibraryStore;
    use crate::media::tools::MockMediaTools;
    use crate::progress::{ProgressReporter, ProgressStatus};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn statuses(&self) -> Vec<ProgressStatus> {
            self.0.lock().unwrap().iter().map(|e| e.status).collect()
        }
    }

    fn touch(path: &Path) -> Result<()> {
        fs::write(path, b"audio").unwrap();
        Ok(())
    }

    fn working_tools(downloads: usize) -> MockMediaTools {
        let mut tools = MockMediaTools::new();
        tools
            .expect_download_track()
            .times(downloads)
            .returning(|_, out| touch(out));
        tools
            .expect_normalize_loudness()
            .returning(|_, out| touch(out));
        tools
            .expect_synthesize_speech()
            .returning(|_, out| touch(out));
        tools
            .expect_generate_silence()
            .returning(|_, out| touch(out));
        tools
            .expect_concatenate()
            .withf(|inputs, _| inputs.len() == 3)
            .returning(|_, out| touch(out));
        tools
    }

    fn request(id: &str, title: &str) -> TrackRequest {
        TrackRequest {
            id: id.to_string(),
            title: title.to_string(),
        }
    }

    fn playlist(id: &str) -> PlaylistRequest {
        PlaylistRequest {
            id: id.to_string(),
            title: id.to_string(),
            tracks: Vec::new(),
        }
    }

    #[test]
    fn test_track_reaches_ready_through_all_stages() {
        let temp = TempDir::new().unwrap();
        let store = LibraryStore::new(temp.path());
        let tools = working_tools(1);
        let recorder = Recorder::default();
        let config = PipelineConfig::default();
        let pipeline = MediaPipeline::new(&store, &tools, &recorder, &config);

        let record = pipeline.ensure_track(&request("v1", "Song A"), Some(&playlist("p1")));

        assert_eq!(record.status, TrackStatus::Ready);
        let path = record.mp3_path.clone().unwrap();
        assert!(path.is_file());
        assert_eq!(path.file_name().unwrap(), "Song_A__normalized__v1.mp3");
        assert_eq!(record.playlist_ids, vec!["p1"]);
        assert_eq!(
            recorder.statuses(),
            vec![
                ProgressStatus::Started,
                ProgressStatus::Downloading,
                ProgressStatus::Normalizing,
                ProgressStatus::AddingIntro,
                ProgressStatus::Completed,
            ]
        );

        let stored = store.load_tracks().unwrap();
        assert_eq!(stored.get("v1").unwrap(), &record);
    }

    #[test]
    fn test_second_call_is_skipped() {
        let temp = TempDir::new().unwrap();
        let store = LibraryStore::new(temp.path());
        let tools = working_tools(1);
        let recorder = Recorder::default();
        let config = PipelineConfig::default();
        let pipeline = MediaPipeline::new(&store, &tools, &recorder, &config);

        let first = pipeline.ensure_track(&request("v1", "Song A"), None);
        let second = pipeline.ensure_track(&request("v1", "Song A"), None);

        assert_eq!(first, second);
        assert_eq!(recorder.statuses().last(), Some(&ProgressStatus::Skipped));
    }

    #[test]
    fn test_missing_artifact_triggers_rerun() {
        let temp = TempDir::new().unwrap();
        let store = LibraryStore::new(temp.path());
        let tools = working_tools(2);
        let recorder = Recorder::default();
        let config = PipelineConfig::default();
        let pipeline = MediaPipeline::new(&store, &tools, &recorder, &config);

        let first = pipeline.ensure_track(&request("v1", "Song A"), None);
        fs::remove_file(first.mp3_path.unwrap()).unwrap();

        let second = pipeline.ensure_track(&request("v1", "Song A"), None);
        assert_eq!(second.status, TrackStatus::Ready);
        assert!(second.mp3_path.unwrap().is_file());
    }

    #[test]
    fn test_tool_failure_marks_error_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let store = LibraryStore::new(temp.path());
        let mut tools = MockMediaTools::new();
        let seen_dir: std::sync::Arc<Mutex<Option<PathBuf>>> = std::sync::Arc::default();
        let seen = seen_dir.clone();
        tools.expect_download_track().returning(move |_, out| {
            *seen.lock().unwrap() = out.parent().map(Path::to_path_buf);
            touch(out)
        });
        tools.expect_normalize_loudness().returning(|_, _| {
            Err(Error::Tool(ToolError::TimedOut {
                tool: "ffmpeg".to_string(),
                secs: 600,
            }))
        });
        let recorder = Recorder::default();
        let config = PipelineConfig::default();
        let pipeline = MediaPipeline::new(&store, &tools, &recorder, &config);

        let record = pipeline.ensure_track(&request("v1", "Song A"), None);

        assert_eq!(record.status, TrackStatus::Error);
        assert!(record.mp3_path.is_none());
        assert!(record.error_message.unwrap().contains("timed out"));
        assert_eq!(recorder.statuses().last(), Some(&ProgressStatus::Error));

        let stored = store.load_tracks().unwrap();
        assert_eq!(stored.get("v1").unwrap().status, TrackStatus::Error);

        // Scratch directory is gone
        let dir = seen_dir.lock().unwrap().clone().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_error_record_is_retried_from_the_top() {
        let temp = TempDir::new().unwrap();
        let store = LibraryStore::new(temp.path());
        let mut failed = TrackRecord::new("v1", "Song A");
        failed.status = TrackStatus::Error;
        failed.error_message = Some("earlier failure".to_string());
        store.upsert::<Tracks>(&failed).unwrap();

        let tools = working_tools(1);
        let recorder = Recorder::default();
        let config = PipelineConfig::default();
        let pipeline = MediaPipeline::new(&store, &tools, &recorder, &config);

        let record = pipeline.ensure_track(&request("v1", "Song A"), None);
        assert_eq!(record.status, TrackStatus::Ready);
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_skipped_track_gains_new_playlist() {
        let temp = TempDir::new().unwrap();
        let store = LibraryStore::new(temp.path());
        let tools = working_tools(1);
        let recorder = Recorder::default();
        let config = PipelineConfig::default();
        let pipeline = MediaPipeline::new(&store, &tools, &recorder, &config);

        pipeline.ensure_track(&request("v1", "Song A"), Some(&playlist("p1")));
        let record = pipeline.ensure_track(&request("v1", "Song A"), Some(&playlist("p2")));

        assert_eq!(record.playlist_ids, vec!["p1", "p2"]);
        let stored = store.load_tracks().unwrap();
        assert_eq!(stored.get("v1").unwrap().playlist_ids, vec!["p1", "p2"]);
    }

    #[test]
    fn test_sync_playlist_isolates_failures() {
        let temp = TempDir::new().unwrap();
        let store = LibraryStore::new(temp.path());
        let mut tools = MockMediaTools::new();
        tools.expect_download_track().returning(|id, out| {
            if id == "v2" {
                return Err(Error::Tool(ToolError::Failed {
                    tool: "yt-dlp".to_string(),
                    code: Some(1),
                    stderr: "Video unavailable".to_string(),
                }));
            }
            touch(out)
        });
        tools
            .expect_normalize_loudness()
            .returning(|_, out| touch(out));
        tools
            .expect_synthesize_speech()
            .returning(|_, out| touch(out));
        tools
            .expect_generate_silence()
            .returning(|_, out| touch(out));
        tools.expect_concatenate().returning(|_, out| touch(out));

        let recorder = Recorder::default();
        let config = PipelineConfig::default();
        let pipeline = MediaPipeline::new(&store, &tools, &recorder, &config);
        let tracks = vec![
            request("v1", "One"),
            request("v2", "Two"),
            request("v3", "Three"),
        ];

        let summary = pipeline.sync_playlist(&playlist("p1"), &tracks);
        assert_eq!(summary.ready, 2);
        assert_eq!(summary.failed, 1);

        let stored = store.load_tracks().unwrap();
        assert_eq!(stored.get("v1").unwrap().status, TrackStatus::Ready);
        assert_eq!(stored.get("v2").unwrap().status, TrackStatus::Error);
        assert_eq!(stored.get("v3").unwrap().status, TrackStatus::Ready);
    }
}
