//! Full sync passes and the single-worker job queue that runs them.
//!
//! This module provides:
//! - [`FullSyncPass`]: episodes, then playlists, then the device if one is attached
//! - [`SyncOrchestrator`]: a cloneable, non-blocking handle for enqueueing jobs
//! - [`SyncWorker`]: drains the queue, one job at a time, in FIFO order
//!
//! Full-pass triggers that arrive while a full pass is already queued are
//! coalesced into it. A trigger that arrives while a pass is running queues
//! exactly one more.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, PipelineConfig};
use crate::device::{DesiredCollection, DeviceReconciler, DeviceStatus, ReconcileReport};
use crate::error::Result;
use crate::library::LibraryStore;
use crate::media::{BatchSummary, MediaPipeline, MediaTools};
use crate::progress::{ProgressEvent, ProgressReporter, ProgressStatus, SyncPhase};
use crate::requests::{EpisodeRequest, PlaylistRequest, TrackRequest};

/// A unit of work for the worker.
pub type SyncJob = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Something the worker can run as a full pass.
pub trait SyncPass: Send + Sync {
    /// Run one pass to completion.
    fn run(&self) -> Result<()>;
}

// =============================================================================
// Full pass
// =============================================================================

/// What a full pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    /// Episode pipeline outcome.
    pub episodes: BatchSummary,
    /// Track pipeline outcome, over all playlists.
    pub tracks: BatchSummary,
    /// Playlists whose listing could not be resolved.
    pub unresolved_playlists: Vec<String>,
    /// Device reconciliation, if a device was attached.
    pub device: Option<ReconcileReport>,
}

/// A playlist with the tracks this pass works with.
struct ResolvedPlaylist {
    request: PlaylistRequest,
    /// `None` when the listing failed.
    tracks: Option<Vec<TrackRequest>>,
}

/// Episodes, then tracks, then the device.
pub struct FullSyncPass {
    store: LibraryStore,
    tools: Arc<dyn MediaTools>,
    reporter: Arc<dyn ProgressReporter>,
    device: Arc<dyn DeviceStatus>,
    pipeline: PipelineConfig,
    playlist_item_limit: usize,
}

impl FullSyncPass {
    /// Create a pass over the library configured in `config`.
    #[must_use]
    pub fn new(
        config: &AppConfig,
        tools: Arc<dyn MediaTools>,
        reporter: Arc<dyn ProgressReporter>,
        device: Arc<dyn DeviceStatus>,
    ) -> Self {
        Self {
            store: LibraryStore::new(&config.library_path),
            tools,
            reporter,
            device,
            pipeline: config.pipeline.clone(),
            playlist_item_limit: config.device_sync.playlist_item_limit,
        }
    }

    /// The library this pass maintains.
    #[must_use]
    pub const fn store(&self) -> &LibraryStore {
        &self.store
    }

    /// Run the pass and report what happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the desired state or the library cannot be read,
    /// or the device ledger cannot be written. Item and collection failures
    /// are contained and only show up in the report.
    pub fn run_pass(&self) -> Result<PassReport> {
        info!("Starting full sync pass");
        let pipeline = MediaPipeline::new(
            &self.store,
            self.tools.as_ref(),
            self.reporter.as_ref(),
            &self.pipeline,
        );
        let mut report = PassReport::default();

        let episodes = self.store.load_episode_requests()?;
        report.episodes = pipeline.sync_episodes(&episodes);

        let playlists: Vec<ResolvedPlaylist> = self
            .store
            .load_playlist_requests()?
            .into_iter()
            .map(|request| self.resolve(request))
            .collect();
        for playlist in &playlists {
            match &playlist.tracks {
                Some(tracks) => report
                    .tracks
                    .merge(pipeline.sync_playlist(&playlist.request, tracks)),
                None => report.unresolved_playlists.push(playlist.request.id.clone()),
            }
        }

        match self.device.mount_point() {
            Some(root) => {
                let desired = self.desired_collections(&playlists, &episodes)?;
                let reconciler = DeviceReconciler::new(&root, &self.store, self.reporter.as_ref());
                report.device = Some(reconciler.reconcile(&desired)?);
            }
            None => info!("No device attached, skipping device sync"),
        }

        info!(
            "Full sync pass finished: episodes {}; tracks {}",
            report.episodes.summary(),
            report.tracks.summary()
        );
        Ok(report)
    }

    /// Fill in the tracks of a playlist that was requested without them.
    fn resolve(&self, request: PlaylistRequest) -> ResolvedPlaylist {
        if !request.tracks.is_empty() {
            let tracks = request.tracks.clone();
            return ResolvedPlaylist {
                request,
                tracks: Some(tracks),
            };
        }

        match self.tools.list_playlist(&request.id) {
            Ok(info) => {
                debug!(
                    "Resolved playlist {} to {} tracks",
                    request.id,
                    info.tracks.len()
                );
                ResolvedPlaylist {
                    request,
                    tracks: Some(info.tracks),
                }
            }
            Err(e) => {
                error!("Could not list playlist {}: {}", request.id, e);
                self.reporter.report(
                    ProgressEvent::new(SyncPhase::YoutubeLibrary, ProgressStatus::Error)
                        .with_collection(&request.id, &request.title)
                        .with_message(e.to_string()),
                );
                ResolvedPlaylist {
                    request,
                    tracks: None,
                }
            }
        }
    }

    fn desired_collections(
        &self,
        playlists: &[ResolvedPlaylist],
        episodes: &[EpisodeRequest],
    ) -> Result<Vec<DesiredCollection>> {
        let mut desired = Vec::with_capacity(playlists.len() + 1);
        let library = if playlists.iter().any(|p| p.tracks.is_none()) {
            Some(self.store.load_tracks()?)
        } else {
            None
        };

        for playlist in playlists {
            let ids: Vec<String> = match (&playlist.tracks, &library) {
                (Some(tracks), _) => tracks.iter().map(|t| t.id.clone()).collect(),
                // Keep what the library already knows about this playlist
                (None, Some(known)) => known
                    .items
                    .values()
                    .filter(|t| t.playlist_ids.contains(&playlist.request.id))
                    .map(|t| t.id.clone())
                    .collect(),
                (None, None) => Vec::new(),
            };
            desired.push(DesiredCollection::playlist(
                &playlist.request,
                ids,
                self.playlist_item_limit,
            ));
        }

        if !episodes.is_empty() {
            desired.push(DesiredCollection::podcasts(episodes));
        }
        Ok(desired)
    }
}

impl SyncPass for FullSyncPass {
    fn run(&self) -> Result<()> {
        self.run_pass().map(|_| ())
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

enum QueuedJob {
    FullSync,
    Custom { name: String, job: SyncJob },
}

impl fmt::Display for QueuedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullSync => write!(f, "full sync"),
            Self::Custom { name, .. } => write!(f, "{name}"),
        }
    }
}

/// Handle for enqueueing work. Cheap to clone and never blocks.
#[derive(Clone)]
pub struct SyncOrchestrator {
    jobs: mpsc::UnboundedSender<QueuedJob>,
    full_sync_pending: Arc<AtomicBool>,
}

impl SyncOrchestrator {
    /// Create an orchestrator and the worker that serves it.
    ///
    /// The worker does nothing until [`SyncWorker::run`] is spawned.
    #[must_use]
    pub fn new(pass: Arc<dyn SyncPass>) -> (Self, SyncWorker) {
        let (jobs, receiver) = mpsc::unbounded_channel();
        let full_sync_pending = Arc::new(AtomicBool::new(false));
        let orchestrator = Self {
            jobs,
            full_sync_pending: Arc::clone(&full_sync_pending),
        };
        let worker = SyncWorker {
            jobs: receiver,
            pass,
            full_sync_pending,
            in_flight: AtomicBool::new(false),
        };
        (orchestrator, worker)
    }

    /// Ask for a full pass.
    ///
    /// Returns `false` if the request was folded into a pass that is
    /// already queued, or if the worker is gone.
    pub fn enqueue_full_sync(&self) -> bool {
        if self.full_sync_pending.swap(true, Ordering::SeqCst) {
            debug!("Full sync already queued");
            return false;
        }
        if self.jobs.send(QueuedJob::FullSync).is_err() {
            self.full_sync_pending.store(false, Ordering::SeqCst);
            warn!("Sync worker is gone, dropping full sync request");
            return false;
        }
        debug!("Full sync queued");
        true
    }

    /// Queue an arbitrary job behind everything already queued.
    ///
    /// Returns `false` if the worker is gone.
    pub fn enqueue(&self, name: impl Into<String>, job: SyncJob) -> bool {
        let name = name.into();
        debug!("Queueing job: {}", name);
        if self.jobs.send(QueuedJob::Custom { name, job }).is_err() {
            warn!("Sync worker is gone, dropping job");
            return false;
        }
        true
    }
}

/// Counts of jobs the worker has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Jobs that returned `Ok`.
    pub succeeded: usize,
    /// Jobs that returned an error or panicked.
    pub failed: usize,
}

/// Runs queued jobs one at a time.
pub struct SyncWorker {
    jobs: mpsc::UnboundedReceiver<QueuedJob>,
    pass: Arc<dyn SyncPass>,
    full_sync_pending: Arc<AtomicBool>,
    in_flight: AtomicBool,
}

impl SyncWorker {
    /// Drain the queue until every [`SyncOrchestrator`] handle is dropped.
    ///
    /// Each job runs on the blocking pool. Errors and panics are logged and
    /// never stop the worker.
    pub async fn run(mut self) -> WorkerStats {
        info!("Sync worker started");
        let mut stats = WorkerStats::default();

        while let Some(job) = self.jobs.recv().await {
            let label = job.to_string();
            if self.in_flight.swap(true, Ordering::SeqCst) {
                error!("Job '{}' started while another job was running", label);
            }

            let work: SyncJob = match job {
                QueuedJob::FullSync => {
                    // Triggers from here on queue one more pass
                    self.full_sync_pending.store(false, Ordering::SeqCst);
                    let pass = Arc::clone(&self.pass);
                    Box::new(move || pass.run())
                }
                QueuedJob::Custom { job, .. } => job,
            };

            debug!("Running job: {}", label);
            match tokio::task::spawn_blocking(work).await {
                Ok(Ok(())) => {
                    stats.succeeded += 1;
                    debug!("Job '{}' finished", label);
                }
                Ok(Err(e)) => {
                    stats.failed += 1;
                    error!("Job '{}' failed ({}): {}", label, e.kind(), e);
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("Job '{}' panicked: {}", label, e);
                }
            }
            self.in_flight.store(false, Ordering::SeqCst);
        }

        info!(
            "Sync worker stopped: {} jobs succeeded, {} failed",
            stats.succeeded, stats.failed
        );
        stats
    }
}
