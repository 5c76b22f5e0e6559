//! Episode pipeline: download, split into segments, announce each segment.

use std::fs;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{Result, ToolError, create_dir_error};
use crate::library::{EpisodeRecord, EpisodeStatus, Episodes};
use crate::media::pipeline::{
    BatchSummary, ItemOutcome, MediaPipeline, Scope, install_dir, work_dir,
};
use crate::progress::{ProgressEvent, ProgressStatus, SyncPhase};
use crate::requests::EpisodeRequest;
use crate::sanitize::{episode_dir_name, sanitize_name, segment_file_name};

const PHASE: SyncPhase = SyncPhase::PodcastLibrary;

/// Spoken lead-in of segment `index` (1-based) out of `total`.
#[must_use]
pub fn segment_intro_text(date: DateTime<Utc>, index: usize, total: usize) -> String {
    format!("{}. {index} of {total}", date.format("%B %d"))
}

impl MediaPipeline<'_> {
    /// Make sure an episode is segmented and ready in the library.
    pub fn ensure_episode(&self, request: &EpisodeRequest) -> EpisodeRecord {
        self.ensure_episode_in(request, Scope::default()).0
    }

    /// Ensure every requested episode, in the given order.
    pub fn sync_episodes(&self, requests: &[EpisodeRequest]) -> BatchSummary {
        info!("Syncing {} podcast episodes", requests.len());
        self.reporter.report(
            ProgressEvent::new(PHASE, ProgressStatus::Started).with_counts(0, requests.len()),
        );

        let mut summary = BatchSummary::default();
        for (index, request) in requests.iter().enumerate() {
            let scope = Scope {
                collection: None,
                position: Some((index + 1, requests.len())),
            };
            let (_, outcome) = self.ensure_episode_in(request, scope);
            summary.record(outcome);
        }

        self.reporter.report(
            ProgressEvent::new(PHASE, ProgressStatus::Completed)
                .with_counts(requests.len(), requests.len())
                .with_message(summary.summary()),
        );
        info!("Podcast episodes: {}", summary.summary());
        summary
    }

    fn ensure_episode_in(
        &self,
        request: &EpisodeRequest,
        scope: Scope<'_>,
    ) -> (EpisodeRecord, ItemOutcome) {
        let existing = match self.store.load_episodes() {
            Ok(episodes) => episodes.get(&request.id).cloned(),
            Err(e) => {
                warn!("Could not read episode library: {}", e);
                None
            }
        };

        if let Some(record) = existing.as_ref()
            && record.is_available()
        {
            debug!("Episode {} already ready, skipping", record.id);
            self.emit(
                PHASE,
                ProgressStatus::Skipped,
                (&record.id, &record.title),
                scope,
                None,
            );
            return (record.clone(), ItemOutcome::Skipped);
        }

        let is_new = existing.is_none();
        let mut record = existing
            .unwrap_or_else(|| EpisodeRecord::new(&request.id, &request.title, request.date));
        record.title.clone_from(&request.title);
        record.date = Some(request.date);
        if is_new {
            self.persist_quietly::<Episodes>(&record);
        }
        self.emit(
            PHASE,
            ProgressStatus::Started,
            (&record.id, &record.title),
            scope,
            None,
        );

        match self.process_episode(&mut record, request, scope) {
            Ok(()) => {
                info!(
                    "Episode {} ready with {} segments",
                    record.id,
                    record.segment_count.unwrap_or(0)
                );
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
                error!("Episode {} failed: {}", record.id, e);
                record.status = EpisodeStatus::Error;
                record.episode_dir = None;
                record.segment_count = None;
                record.error_message = Some(e.to_string());
                self.persist_quietly::<Episodes>(&record);
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

    fn process_episode(
        &self,
        record: &mut EpisodeRecord,
        request: &EpisodeRequest,
        scope: Scope<'_>,
    ) -> Result<()> {
        let workdir = work_dir(&record.id)?;
        let stem = sanitize_name(&record.id, "episode");
        let source = workdir.path().join(format!("{stem}_source.mp3"));
        let segments_dir = workdir.path().join("segments");
        let output_dir = workdir.path().join("output");
        let silence = workdir.path().join("silence.mp3");
        for dir in [&segments_dir, &output_dir] {
            fs::create_dir_all(dir).map_err(|e| create_dir_error(dir, &e))?;
        }

        self.advance_episode(
            record,
            EpisodeStatus::Downloading,
            ProgressStatus::Downloading,
            scope,
        )?;
        self.tools
            .download_episode(&request.download_url, &source)?;

        self.advance_episode(
            record,
            EpisodeStatus::Segmenting,
            ProgressStatus::Segmenting,
            scope,
        )?;
        let segments =
            self.tools
                .split_into_segments(&source, self.config.segment_length(), &segments_dir)?;
        if segments.is_empty() {
            return Err(ToolError::MissingOutput {
                tool: "ffmpeg".to_string(),
                path: segments_dir,
            }
            .into());
        }
        // The source can be large; free the space before producing output.
        if let Err(e) = fs::remove_file(&source) {
            debug!("Could not remove {}: {}", source.display(), e);
        }

        self.tools
            .generate_silence(self.config.silence_gap(), &silence)?;

        let total = segments.len();
        let mut finished = Vec::with_capacity(total);
        for (i, segment) in segments.iter().enumerate() {
            let index = i + 1;
            let intro = workdir.path().join(format!("intro_{index:03}.mp3"));
            self.tools
                .synthesize_speech(&segment_intro_text(request.date, index, total), &intro)?;

            let output = output_dir.join(segment_file_name(&record.title, &record.id, index));
            self.tools
                .concatenate(&[intro, silence.clone(), segment.clone()], &output)?;
            finished.push(output);
        }

        let destination = self
            .store
            .domain_dir::<Episodes>()
            .join(episode_dir_name(&record.title, &record.id));
        install_dir(&finished, &destination)?;

        record.status = EpisodeStatus::Ready;
        record.episode_dir = Some(destination);
        record.segment_count = Some(total);
        record.error_message = None;
        self.store.upsert::<Episodes>(record)
    }

    fn advance_episode(
        &self,
        record: &mut EpisodeRecord,
        status: EpisodeStatus,
        progress: ProgressStatus,
        scope: Scope<'_>,
    ) -> Result<()> {
        record.status = status;
        record.episode_dir = None;
        record.segment_count = None;
        record.error_message = None;
        self.store.upsert::<Episodes>(record)?;
        self.emit(PHASE, progress, (&record.id, &record.title), scope, None);
        Ok(())
    }
}
