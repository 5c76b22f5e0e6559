//! Error types for the Open Swim core library.
//!
//! Errors are grouped by the unit that contains them:
//! - [`RequestError`]: a malformed desired-state payload or entry
//! - [`ToolError`]: an external tool exited non-zero, timed out or produced nothing
//! - [`StorageError`]: a filesystem operation on the library or the device failed
//! - [`Error::StateCorruption`]: a persisted document could not be parsed
//!
//! Everything funnels into [`Error`] so `?` works across module boundaries.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the core library.
#[derive(Debug, Error)]
pub enum Error {
    /// Desired-state input could not be accepted.
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    /// An external tool invocation failed.
    #[error("Tool failure: {0}")]
    Tool(#[from] ToolError),

    /// A filesystem operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted document exists but could not be parsed.
    #[error("Corrupt state document {}: {reason}", path.display())]
    StateCorruption {
        /// Path to the document.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },

    /// Device related error.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Raw IO error that was not mapped to a storage error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Malformed desired-state input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The payload as a whole is not an array of request objects.
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// Parser diagnostic.
        reason: String,
    },

    /// A single entry was rejected.
    #[error("entry {index} rejected: {reason}")]
    InvalidEntry {
        /// Position of the entry in the payload.
        index: usize,
        /// Why it was rejected.
        reason: String,
    },
}

/// External tool failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The tool ran and exited with a non-zero status.
    #[error("{tool} exited with code {}: {stderr}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        /// Tool name.
        tool: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Tail of the captured stderr.
        stderr: String,
    },

    /// The tool did not finish within its timeout.
    #[error("{tool} timed out after {secs}s")]
    TimedOut {
        /// Tool name.
        tool: String,
        /// Timeout that elapsed.
        secs: u64,
    },

    /// The tool could not be started at all.
    #[error("failed to start {tool}: {reason}")]
    SpawnFailed {
        /// Tool name.
        tool: String,
        /// OS diagnostic.
        reason: String,
    },

    /// The tool exited successfully but did not produce its output.
    #[error("{tool} produced no output at {}", path.display())]
    MissingOutput {
        /// Tool name.
        tool: String,
        /// Expected output path.
        path: PathBuf,
    },

    /// An HTTP download failed.
    #[error("download of {url} failed: {reason}")]
    Http {
        /// Source URL.
        url: String,
        /// Transport diagnostic.
        reason: String,
    },
}

/// Filesystem failures on the library or the device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Reading a file failed.
    #[error("failed to read {}: {reason}", path.display())]
    ReadFailed {
        /// Path involved.
        path: PathBuf,
        /// OS diagnostic.
        reason: String,
    },

    /// Writing a file failed.
    #[error("failed to write {}: {reason}", path.display())]
    WriteFailed {
        /// Path involved.
        path: PathBuf,
        /// OS diagnostic.
        reason: String,
    },

    /// Creating a directory failed.
    #[error("failed to create directory {}: {reason}", path.display())]
    CreateDirFailed {
        /// Path involved.
        path: PathBuf,
        /// OS diagnostic.
        reason: String,
    },

    /// Removing a file or directory failed.
    #[error("failed to delete {}: {reason}", path.display())]
    DeleteFailed {
        /// Path involved.
        path: PathBuf,
        /// OS diagnostic.
        reason: String,
    },

    /// Copying a file failed.
    #[error("failed to copy {} to {}: {reason}", from.display(), to.display())]
    CopyFailed {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// OS diagnostic.
        reason: String,
    },
}

/// Device errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// A device lookup failed.
    #[error("device not found: {name}")]
    NotFound {
        /// Label or mount point that was searched for.
        name: String,
    },
}

/// Coarse error classification used in logs and progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`RequestError`].
    Request,
    /// See [`ToolError`].
    Tool,
    /// See [`StorageError`] and raw IO errors.
    Storage,
    /// Unparseable persisted state.
    StateCorruption,
    /// Device availability.
    Device,
    /// Configuration problems.
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Tool => write!(f, "tool"),
            Self::Storage => write!(f, "storage"),
            Self::StateCorruption => write!(f, "state_corruption"),
            Self::Device => write!(f, "device"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Request(_) => ErrorKind::Request,
            Self::Tool(_) => ErrorKind::Tool,
            Self::Storage(_) | Self::Io(_) => ErrorKind::Storage,
            Self::StateCorruption { .. } | Self::Serialization(_) => ErrorKind::StateCorruption,
            Self::Device(_) => ErrorKind::Device,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

// =============================================================================
// Storage error helpers
// =============================================================================

/// Build a read error for `path`.
pub(crate) fn read_error(path: impl Into<PathBuf>, e: &std::io::Error) -> Error {
    Error::Storage(StorageError::ReadFailed {
        path: path.into(),
        reason: e.to_string(),
    })
}

/// Build a write error for `path`.
pub(crate) fn write_error(path: impl Into<PathBuf>, e: &impl std::fmt::Display) -> Error {
    Error::Storage(StorageError::WriteFailed {
        path: path.into(),
        reason: e.to_string(),
    })
}

/// Build a create-directory error for `path`.
pub(crate) fn create_dir_error(path: impl Into<PathBuf>, e: &std::io::Error) -> Error {
    Error::Storage(StorageError::CreateDirFailed {
        path: path.into(),
        reason: e.to_string(),
    })
}

/// Build a delete error for `path`.
pub(crate) fn delete_error(path: impl Into<PathBuf>, e: &std::io::Error) -> Error {
    Error::Storage(StorageError::DeleteFailed {
        path: path.into(),
        reason: e.to_string(),
    })
}

/// Build a copy error.
pub(crate) fn copy_error(
    from: impl Into<PathBuf>,
    to: impl Into<PathBuf>,
    e: &std::io::Error,
) -> Error {
    Error::Storage(StorageError::CopyFailed {
        from: from.into(),
        to: to.into(),
        reason: e.to_string(),
    })
}
