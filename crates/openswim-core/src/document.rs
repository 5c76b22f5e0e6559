//! Whole-document JSON persistence.
//!
//! Every persisted structure (library collections, desired-state lists, the
//! device ledger) is read and written as one JSON document. Writes go to a
//! temporary file in the target directory which is then renamed over the
//! target, so readers see either the previous or the new document.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Error, Result, create_dir_error, read_error, write_error};

/// Read a document.
///
/// Returns `Ok(None)` if the file does not exist.
///
/// # Errors
///
/// Returns `Error::StateCorruption` if the file cannot be parsed, or a
/// storage error if it cannot be read.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(read_error(path, &e)),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::StateCorruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Read a document, falling back to `T::default()` when it is missing or corrupt.
///
/// # Errors
///
/// Returns a storage error only if the file exists but cannot be read.
pub fn load_document_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match load_document(path) {
        Ok(Some(doc)) => Ok(doc),
        Ok(None) => {
            debug!("No document at {}, starting empty", path.display());
            Ok(T::default())
        }
        Err(e @ Error::StateCorruption { .. }) => {
            warn!("{}; starting from empty", e);
            Ok(T::default())
        }
        Err(e) => Err(e),
    }
}

/// Atomically replace the document at `path`.
///
/// # Errors
///
/// Returns a storage error if the directory cannot be created or the
/// document cannot be written or renamed into place.
pub fn save_document<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| create_dir_error(parent, &e))?;

    let content = serde_json::to_vec_pretty(document)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| write_error(path, &e))?;
    tmp.write_all(&content).map_err(|e| write_error(path, &e))?;
    tmp.as_file().sync_all().map_err(|e| write_error(path, &e))?;
    tmp.persist(path).map_err(|e| write_error(path, &e.error))?;

    debug!("Saved {} ({} bytes)", path.display(), content.len());
    Ok(())
}
