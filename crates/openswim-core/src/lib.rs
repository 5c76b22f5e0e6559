//! `OpenSwim` Core Library
//!
//! This crate keeps a local library of YouTube tracks and podcast episodes
//! in shape for an Open Swim headphone, and mirrors it onto the device:
//! - Desired-state requests for playlists and episodes
//! - A durable JSON library store with per-item status
//! - Track and episode pipelines over external tools (yt-dlp, ffmpeg, piper)
//! - Content-hash based reconciliation of device collections
//! - A single-worker orchestrator that runs full sync passes
//! - Progress events for every stage transition
//!
//! # Error Handling
//!
//! Fallible operations return [`Result`], with typed sub-errors per failure
//! class. See the [`error`] module for details.
//!
//! ```rust,ignore
//! use openswim_core::{AppConfig, LibraryStore, Result};
//!
//! fn tracks_ready() -> Result<usize> {
//!     let config = AppConfig::load()?;
//!     let store = LibraryStore::new(&config.library_path);
//!     Ok(store.load_tracks()?.items.values().filter(|t| t.is_available()).count())
//! }
//! ```

pub mod config;
pub mod device;
pub mod document;
pub mod error;
pub mod library;
pub mod media;
pub mod progress;
pub mod requests;
pub mod sanitize;
pub mod sync;

pub use config::{
    AppConfig, DEFAULT_PLAYLIST_ITEM_LIMIT, DEFAULT_VOLUME_LABEL, DeviceConfig, DeviceSyncConfig,
    PipelineConfig, ToolConfig, default_library_directory, validate_library_directory,
};
pub use device::{
    CollectionKind, DEFAULT_POLL_INTERVAL, DesiredCollection, DeviceCollectionEntry,
    DeviceDetector, DeviceEvent, DeviceManager, DevicePresence, DeviceReconciler, DeviceStatus,
    DeviceSyncState, DeviceWatcher, DeviceWatcherHandle, ReconcileReport, content_hash,
};
pub use error::{
    DeviceError, Error, ErrorKind, RequestError, Result, StorageError, ToolError,
};
pub use library::{
    EpisodeRecord, EpisodeStatus, Episodes, LibraryCollection, LibraryDomain, LibraryRecord,
    LibraryStore, TrackRecord, TrackStatus, Tracks,
};
pub use media::{
    BatchSummary, CommandRunner, ExternalMediaTools, ItemOutcome, MediaPipeline, MediaTools,
    PlaylistInfo, PlaylistInfoResponse, SystemCommandRunner, ToolInvocation, ToolOutput,
    lookup_playlist, playlist_id_from_input,
};
pub use progress::{
    ChannelProgressReporter, NullProgressReporter, ProgressEvent, ProgressReporter,
    ProgressStatus, SyncPhase,
};
pub use requests::{EpisodeRequest, PlaylistRequest, TrackRequest, collect_valid};
pub use sync::{
    FullSyncPass, PassReport, SyncJob, SyncOrchestrator, SyncPass, SyncWorker, WorkerStats,
};
