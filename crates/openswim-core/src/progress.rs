//! Progress reporting for sync passes.
//!
//! Pipelines and the reconciler describe what they are doing through
//! [`ProgressEvent`]s handed to a [`ProgressReporter`]. Reporting is
//! best-effort: reporters never return errors and a dropped event never
//! affects the operation being reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Which part of a sync pass an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Episode library pipeline.
    PodcastLibrary,
    /// Track library pipeline.
    YoutubeLibrary,
    /// Mirroring the episode set to the device.
    DevicePodcast,
    /// Mirroring playlists to the device.
    DeviceYoutube,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PodcastLibrary => write!(f, "podcast_library"),
            Self::YoutubeLibrary => write!(f, "youtube_library"),
            Self::DevicePodcast => write!(f, "device_podcast"),
            Self::DeviceYoutube => write!(f, "device_youtube"),
        }
    }
}

/// What happened to the item or collection an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Work on the item or collection began.
    Started,
    /// Fetching source audio.
    Downloading,
    /// Loudness normalization.
    Normalizing,
    /// Prepending the spoken intro.
    AddingIntro,
    /// Splitting an episode into segments.
    Segmenting,
    /// Copying files to the device.
    Copying,
    /// Finished successfully.
    Completed,
    /// Nothing to do, or the item could not be used.
    Skipped,
    /// Failed.
    Error,
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Downloading => "downloading",
            Self::Normalizing => "normalizing",
            Self::AddingIntro => "adding_intro",
            Self::Segmenting => "segmenting",
            Self::Copying => "copying",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One structured progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Phase of the pass.
    pub phase: SyncPhase,
    /// Status being reported.
    pub status: ProgressStatus,
    /// Collection (playlist or episode set) identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Collection display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_title: Option<String>,
    /// Item identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Item display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_title: Option<String>,
    /// 1-based position of the item within its batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<usize>,
    /// Size of the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    /// `current / total * 100`, rounded to one decimal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    /// Error or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Create an event with only phase and status set.
    #[must_use]
    pub fn new(phase: SyncPhase, status: ProgressStatus) -> Self {
        Self {
            phase,
            status,
            collection_id: None,
            collection_title: None,
            item_id: None,
            item_title: None,
            current: None,
            total: None,
            percentage: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a collection.
    #[must_use]
    pub fn with_collection(mut self, id: impl Into<String>, title: impl Into<String>) -> Self {
        self.collection_id = Some(id.into());
        self.collection_title = Some(title.into());
        self
    }

    /// Attach an item.
    #[must_use]
    pub fn with_item(mut self, id: impl Into<String>, title: impl Into<String>) -> Self {
        self.item_id = Some(id.into());
        self.item_title = Some(title.into());
        self
    }

    /// Attach counters and derive the percentage.
    #[must_use]
    pub fn with_counts(mut self, current: usize, total: usize) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        self.percentage = (total > 0).then(|| {
            let pct = current as f64 / total as f64 * 100.0;
            (pct * 10.0).round() / 10.0
        });
        self
    }

    /// Attach an error or skip reason.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Short human readable summary, used for log lines.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!("[{}] {}", self.phase, self.status);
        if let Some(title) = self.collection_title.as_ref().or(self.collection_id.as_ref()) {
            out.push_str(&format!(" {title}"));
        }
        if let Some(title) = self.item_title.as_ref().or(self.item_id.as_ref()) {
            out.push_str(&format!(" / {title}"));
        }
        if let (Some(current), Some(total)) = (self.current, self.total) {
            out.push_str(&format!(" ({current}/{total})"));
        }
        if let Some(message) = &self.message {
            out.push_str(&format!(": {message}"));
        }
        out
    }
}

/// Sink for progress events.
#[cfg_attr(test, mockall::automock)]
pub trait ProgressReporter: Send + Sync {
    /// Deliver one event. Must not block for long and must not fail.
    fn report(&self, event: ProgressEvent);
}

/// Reporter used when no transport is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn report(&self, _event: ProgressEvent) {}
}

/// Reporter that forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelProgressReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressReporter {
    /// Create a reporter and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn report(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            debug!("Progress receiver dropped, event discarded");
        }
    }
}
