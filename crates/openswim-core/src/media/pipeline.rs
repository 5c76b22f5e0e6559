//! Shared machinery of the track and episode pipelines.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;
use tracing::warn;

use crate::config::PipelineConfig;
use crate::error::{Result, copy_error, create_dir_error, delete_error, write_error};
use crate::library::{LibraryDomain, LibraryStore};
use crate::media::tools::MediaTools;
use crate::progress::{ProgressEvent, ProgressReporter, ProgressStatus, SyncPhase};
use crate::sanitize::sanitize_name;

/// How a single `ensure_*` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Already ready; nothing was run.
    Skipped,
    /// Processed to ready in this call.
    Ready,
    /// Processing failed; the record is in error.
    Failed,
}

/// Tally of a batch of items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Items processed to ready.
    pub ready: usize,
    /// Items that were already ready.
    pub skipped: usize,
    /// Items that ended in error.
    pub failed: usize,
}

impl BatchSummary {
    /// Count one outcome.
    pub const fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Ready => self.ready += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }

    /// Add another summary to this one.
    pub const fn merge(&mut self, other: Self) {
        self.ready += other.ready;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    /// Number of items seen.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.ready + self.skipped + self.failed
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} items: {} ready, {} skipped, {} failed",
            self.total(),
            self.ready,
            self.skipped,
            self.failed
        )
    }
}

/// Where an item sits, for progress events.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Scope<'s> {
    pub collection: Option<(&'s str, &'s str)>,
    pub position: Option<(usize, usize)>,
}

/// Turns requested items into finished library artifacts.
///
/// Both pipelines follow the same shape: skip if the item is already ready
/// on disk, otherwise run every stage from the top inside a private
/// temporary directory, persisting the record after each stage. Failures
/// put the record in error and are never propagated to the caller.
pub struct MediaPipeline<'a> {
    pub(crate) store: &'a LibraryStore,
    pub(crate) tools: &'a dyn MediaTools,
    pub(crate) reporter: &'a dyn ProgressReporter,
    pub(crate) config: &'a PipelineConfig,
}

impl<'a> MediaPipeline<'a> {
    /// Create a pipeline over the given collaborators.
    #[must_use]
    pub const fn new(
        store: &'a LibraryStore,
        tools: &'a dyn MediaTools,
        reporter: &'a dyn ProgressReporter,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            store,
            tools,
            reporter,
            config,
        }
    }

    pub(crate) fn emit(
        &self,
        phase: SyncPhase,
        status: ProgressStatus,
        item: (&str, &str),
        scope: Scope<'_>,
        message: Option<String>,
    ) {
        let mut event = ProgressEvent::new(phase, status).with_item(item.0, item.1);
        if let Some((id, title)) = scope.collection {
            event = event.with_collection(id, title);
        }
        if let Some((current, total)) = scope.position {
            event = event.with_counts(current, total);
        }
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.reporter.report(event);
    }

    /// Persist a record, logging instead of failing.
    ///
    /// Used on the error path, where the original failure is what matters.
    pub(crate) fn persist_quietly<D: LibraryDomain>(&self, record: &D::Record) {
        if let Err(e) = self.store.upsert::<D>(record) {
            warn!("Could not persist record after failure: {}", e);
        }
    }
}

/// Private scratch directory for one item, removed when dropped.
pub(crate) fn work_dir(item_id: &str) -> Result<TempDir> {
    let prefix = format!("openswim-{}-", sanitize_name(item_id, "item"));
    tempfile::Builder::new()
        .prefix(&prefix)
        .tempdir()
        .map_err(|e| create_dir_error(std::env::temp_dir().join(prefix), &e))
}

/// Copy `from` to `to` so that `to` appears complete or not at all.
pub(crate) fn install_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| create_dir_error(parent, &e))?;
    }
    let partial = partial_path(to);
    fs::copy(from, &partial).map_err(|e| copy_error(from, &partial, &e))?;
    fs::rename(&partial, to).map_err(|e| write_error(to, &e))?;
    Ok(())
}

/// Replace directory `to` with a directory holding copies of `files`.
pub(crate) fn install_dir(files: &[PathBuf], to: &Path) -> Result<()> {
    let staging = partial_path(to);
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| delete_error(&staging, &e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| create_dir_error(&staging, &e))?;

    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        let dest = staging.join(name);
        fs::copy(file, &dest).map_err(|e| copy_error(file, &dest, &e))?;
    }

    if to.exists() {
        fs::remove_dir_all(to).map_err(|e| delete_error(to, &e))?;
    }
    fs::rename(&staging, to).map_err(|e| write_error(to, &e))?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
