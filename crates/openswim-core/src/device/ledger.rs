//! The device ledger: what the reconciler believes is on the device.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::document::{load_document_or_default, save_document};
use crate::error::Result;

/// Ledger file name at the device root.
pub const LEDGER_FILE: &str = "sync_state.json";

/// Current ledger schema version.
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

const fn default_schema_version() -> u32 {
    LEDGER_SCHEMA_VERSION
}

/// What a device collection mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// A YouTube playlist.
    #[default]
    Playlist,
    /// The podcast episode set.
    Podcasts,
}

impl std::fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Playlist => write!(f, "playlist"),
            Self::Podcasts => write!(f, "podcasts"),
        }
    }
}

/// One mirrored collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCollectionEntry {
    /// Collection identifier.
    pub id: String,
    /// What the collection mirrors.
    #[serde(default)]
    pub kind: CollectionKind,
    /// Directory name relative to the device root.
    pub directory: String,
    /// Hash of the ordered member identifiers at the time of the copy.
    pub content_hash: String,
    /// Number of members that were copied.
    #[serde(default)]
    pub item_count: usize,
}

/// The persisted ledger document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSyncState {
    /// Document schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Mirrored collections.
    #[serde(default)]
    pub collections: Vec<DeviceCollectionEntry>,
}

impl Default for DeviceSyncState {
    fn default() -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            collections: Vec::new(),
        }
    }
}

impl DeviceSyncState {
    /// Path of the ledger on a device.
    #[must_use]
    pub fn path(device_root: &Path) -> PathBuf {
        device_root.join(LEDGER_FILE)
    }

    /// Load the ledger; missing or corrupt ledgers yield an empty one.
    ///
    /// # Errors
    ///
    /// Returns a storage error only if the ledger exists but cannot be read.
    pub fn load(device_root: &Path) -> Result<Self> {
        let path = Self::path(device_root);
        let state: Self = load_document_or_default(&path)?;
        if state.schema_version > LEDGER_SCHEMA_VERSION {
            warn!(
                "Ledger schema version {} is newer than {}",
                state.schema_version, LEDGER_SCHEMA_VERSION
            );
        }
        debug!(
            "Loaded ledger with {} collections from {}",
            state.collections.len(),
            path.display()
        );
        Ok(state)
    }

    /// Atomically replace the ledger on the device.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the ledger cannot be written.
    pub fn save(&self, device_root: &Path) -> Result<()> {
        let mut doc = self.clone();
        doc.schema_version = LEDGER_SCHEMA_VERSION;
        save_document(&Self::path(device_root), &doc)
    }

    /// Entry of a collection.
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<&DeviceCollectionEntry> {
        self.collections.iter().find(|e| e.id == id)
    }

    /// Insert or replace the entry with the same id.
    pub fn upsert(&mut self, entry: DeviceCollectionEntry) {
        if let Some(existing) = self.collections.iter_mut().find(|e| e.id == entry.id) {
            *existing = entry;
        } else {
            self.collections.push(entry);
        }
    }

    /// Drop an entry, returning it.
    pub fn remove(&mut self, id: &str) -> Option<DeviceCollectionEntry> {
        let pos = self.collections.iter().position(|e| e.id == id)?;
        Some(self.collections.remove(pos))
    }
}

/// SHA-256 over the ordered member identifiers, as lowercase hex.
///
/// Each member contributes the line `"{index}:{id}\n"`, so both membership
/// and order change the hash.
#[must_use]
pub fn content_hash<S: AsRef<str>>(member_ids: &[S]) -> String {
    let mut hasher = Sha256::new();
    for (index, id) in member_ids.iter().enumerate() {
        hasher.update(format!("{index}:{}\n", id.as_ref()).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
