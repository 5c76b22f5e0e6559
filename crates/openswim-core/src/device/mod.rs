//! Device presence, detection and reconciliation.
//!
//! This module provides:
//! - [`DeviceEvent`] and the [`DeviceStatus`] capability a sync pass consults
//! - Device detection via the [`DeviceDetector`] trait and the sysinfo-backed [`DeviceManager`]
//! - A polling [`DeviceWatcher`] that turns detection into connect/disconnect events
//! - The [`ledger`] and [`reconcile`] submodules that mirror collections onto the device

pub mod ledger;
pub mod reconcile;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use crate::config::DeviceConfig;

pub use ledger::{CollectionKind, DeviceCollectionEntry, DeviceSyncState, content_hash};
pub use reconcile::{DesiredCollection, DeviceReconciler, ReconcileReport};

// =============================================================================
// Presence
// =============================================================================

/// Device attachment changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DeviceEvent {
    /// The device became available at `mount_point`.
    Connected {
        /// Where the device is mounted.
        mount_point: PathBuf,
    },
    /// The device went away.
    Disconnected,
}

/// Answers whether a device is attached, and where.
pub trait DeviceStatus: Send + Sync {
    /// Mount point of the attached device, if any.
    fn mount_point(&self) -> Option<PathBuf>;
}

/// Shared, event-driven device presence.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct DevicePresence {
    inner: Arc<RwLock<Option<PathBuf>>>,
}

impl DevicePresence {
    /// Presence with no device attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Presence with a device already attached at `mount_point`.
    #[must_use]
    pub fn attached(mount_point: impl Into<PathBuf>) -> Self {
        let presence = Self::new();
        presence.set(Some(mount_point.into()));
        presence
    }

    /// Replace the current mount point.
    pub fn set(&self, mount_point: Option<PathBuf>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = mount_point,
            Err(poisoned) => *poisoned.into_inner() = mount_point,
        }
    }

    /// Apply an event. Returns `true` if a device is now attached.
    pub fn apply(&self, event: &DeviceEvent) -> bool {
        match event {
            DeviceEvent::Connected { mount_point } => {
                info!("Device attached at {}", mount_point.display());
                self.set(Some(mount_point.clone()));
                true
            }
            DeviceEvent::Disconnected => {
                info!("Device detached");
                self.set(None);
                false
            }
        }
    }
}

impl DeviceStatus for DevicePresence {
    fn mount_point(&self) -> Option<PathBuf> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// =============================================================================
// Detection
// =============================================================================

/// Trait for device detection operations.
/// This trait allows for mocking in tests.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceDetector: Send + Sync {
    /// Mount point of the device, if it is currently mounted.
    fn find_device(&self) -> Option<PathBuf>;

    /// Refresh the underlying disk list.
    fn refresh(&mut self);
}

/// Default device detector using `sysinfo`.
pub struct DeviceManager {
    disks: Disks,
    config: DeviceConfig,
}

impl DeviceManager {
    /// Create a device manager looking for the device described by `config`.
    #[must_use]
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            disks: Disks::new_with_refreshed_list(),
            config,
        }
    }

    fn matches_label(&self, disk: &sysinfo::Disk) -> bool {
        let label = self.config.volume_label.as_str();
        if label.is_empty() {
            return false;
        }
        disk.name().to_string_lossy() == label
            || disk
                .mount_point()
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == label)
    }
}

impl DeviceDetector for DeviceManager {
    fn find_device(&self) -> Option<PathBuf> {
        if let Some(configured) = &self.config.mount_point {
            let mounted = self
                .disks
                .iter()
                .any(|disk| disk.mount_point() == configured.as_path());
            return (mounted || configured.is_dir()).then(|| configured.clone());
        }

        self.disks
            .iter()
            .find(|disk| self.matches_label(disk))
            .map(|disk| disk.mount_point().to_path_buf())
    }

    fn refresh(&mut self) {
        self.disks.refresh(true);
    }
}

// =============================================================================
// Device Watching
// =============================================================================

/// Default polling interval for device watching (2 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Handle for controlling a running device watcher.
#[derive(Debug, Clone)]
pub struct DeviceWatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl DeviceWatcherHandle {
    /// Stop the device watcher.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Polls a [`DeviceDetector`] and reports attachment changes.
pub struct DeviceWatcher {
    detector: Box<dyn DeviceDetector>,
    poll_interval: Duration,
}

impl DeviceWatcher {
    /// Create a watcher with the default polling interval.
    #[must_use]
    pub fn new(detector: Box<dyn DeviceDetector>) -> Self {
        Self {
            detector,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Use a custom polling interval.
    #[must_use]
    pub const fn with_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Start watching on the current tokio runtime.
    ///
    /// The first poll happens immediately, so a device that is already
    /// mounted produces a `Connected` event right away. A device that moves
    /// to a new mount point produces `Disconnected` then `Connected`.
    #[must_use]
    pub fn start(self) -> (mpsc::Receiver<DeviceEvent>, DeviceWatcherHandle) {
        let (event_tx, event_rx) = mpsc::channel::<DeviceEvent>(32);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut detector = self.detector;
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut known: Option<PathBuf> = None;
            let mut interval_timer = interval(poll_interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Device watcher shutting down");
                        break;
                    }
                    _ = interval_timer.tick() => {
                        detector.refresh();
                        let current = detector.find_device();
                        if current == known {
                            continue;
                        }

                        if let Some(previous) = &known {
                            info!("Device disconnected: {}", previous.display());
                            if event_tx.send(DeviceEvent::Disconnected).await.is_err() {
                                break;
                            }
                        }
                        if let Some(mount_point) = &current {
                            info!("Device connected at {}", mount_point.display());
                            let event = DeviceEvent::Connected { mount_point: mount_point.clone() };
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        known = current;
                    }
                }
            }
        });

        (event_rx, DeviceWatcherHandle { shutdown_tx })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_presence_follows_events() {
        let presence = DevicePresence::new();
        assert_eq!(presence.mount_point(), None);

        let attached = presence.apply(&DeviceEvent::Connected {
            mount_point: PathBuf::from("/media/OpenSwim"),
        });
        assert!(attached);
        let other = presence.clone();
        assert_eq!(other.mount_point(), Some(PathBuf::from("/media/OpenSwim")));

        assert!(!presence.apply(&DeviceEvent::Disconnected));
        assert_eq!(other.mount_point(), None);
    }

    #[test]
    fn test_device_event_serialization() {
        let event = DeviceEvent::Connected {
            mount_point: PathBuf::from("/media/OpenSwim"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Connected\""));
        assert!(json.contains("/media/OpenSwim"));
        let back: DeviceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_manager_uses_configured_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = DeviceConfig {
            mount_point: Some(temp.path().to_path_buf()),
            ..DeviceConfig::default()
        };
        let manager = DeviceManager::new(config);
        assert_eq!(manager.find_device(), Some(temp.path().to_path_buf()));

        let missing = DeviceConfig {
            mount_point: Some(temp.path().join("not-mounted")),
            ..DeviceConfig::default()
        };
        assert_eq!(DeviceManager::new(missing).find_device(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_reports_connect_and_disconnect() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);

        let mut detector = MockDeviceDetector::new();
        detector.expect_refresh().returning(|| ());
        detector.expect_find_device().returning(move || {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => None,
                1 | 2 => Some(PathBuf::from("/media/OpenSwim")),
                _ => None,
            }
        });

        let watcher = DeviceWatcher::new(Box::new(detector)).with_interval(Duration::from_millis(10));
        let (mut events, handle) = watcher.start();

        assert_eq!(
            events.recv().await,
            Some(DeviceEvent::Connected {
                mount_point: PathBuf::from("/media/OpenSwim")
            })
        );
        assert_eq!(events.recv().await, Some(DeviceEvent::Disconnected));
        assert!(polls.load(Ordering::SeqCst) >= 4);

        handle.stop().await;
    }
}
