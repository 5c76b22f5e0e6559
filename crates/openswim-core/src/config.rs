//! Application configuration management.
//!
//! Configuration is a JSON document in the user's config directory, with
//! environment variable overrides applied on top (`LIBRARY_PATH`,
//! `OPEN_SWIM_SD_PATH`, `FFMPEG_PATH`, `YTDLP_PATH`, `PIPER_CMD`,
//! `PIPER_VOICE_MODEL_PATH`, `PLAYLIST_SYNC_LIMIT`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, StorageError};

/// Volume label the swim player's storage is formatted with.
pub const DEFAULT_VOLUME_LABEL: &str = "OpenSwim";

/// Default number of playlist items mirrored to the device.
pub const DEFAULT_PLAYLIST_ITEM_LIMIT: usize = 20;

// =============================================================================
// Sections
// =============================================================================

/// Where the device is expected to show up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Fixed mount point, if the device is always mounted at the same place.
    pub mount_point: Option<PathBuf>,
    /// Volume label used to find the device among mounted disks.
    pub volume_label: String,
    /// Polling interval of the device watcher in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mount_point: None,
            volume_label: DEFAULT_VOLUME_LABEL.to_string(),
            poll_interval_ms: 2000,
        }
    }
}

impl DeviceConfig {
    /// Polling interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// External tool locations and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    /// Path or name of the ffmpeg binary.
    pub ffmpeg_path: String,
    /// Path or name of the yt-dlp binary.
    pub ytdlp_path: String,
    /// Speech synthesizer command line (program followed by fixed arguments).
    pub piper_command: Vec<String>,
    /// Voice model passed to the speech synthesizer.
    pub piper_voice_model: PathBuf,
    /// Timeout for yt-dlp invocations.
    pub download_timeout_secs: u64,
    /// Timeout for ffmpeg invocations.
    pub transcode_timeout_secs: u64,
    /// Timeout for speech synthesis.
    pub speech_timeout_secs: u64,
    /// Timeout for HTTP episode downloads.
    pub http_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
            piper_command: vec!["piper".to_string()],
            piper_voice_model: PathBuf::from("/voices/en_US-hfc_female-medium.onnx"),
            download_timeout_secs: 300,
            transcode_timeout_secs: 600,
            speech_timeout_secs: 120,
            http_timeout_secs: 600,
        }
    }
}

/// Audio processing parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Length of each podcast segment in seconds.
    pub segment_secs: u64,
    /// Gap between a spoken intro and the audio, in seconds.
    pub silence_secs: f64,
    /// Integrated loudness target (LUFS).
    pub loudness_target: f64,
    /// True-peak ceiling (dBTP).
    pub true_peak: f64,
    /// Loudness range target.
    pub loudness_range: f64,
    /// Output bitrate passed to the encoder, e.g. `128k`.
    pub bitrate: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segment_secs: 600,
            silence_secs: 0.5,
            loudness_target: -16.0,
            true_peak: -1.5,
            loudness_range: 11.0,
            bitrate: "128k".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Segment length as a duration.
    #[must_use]
    pub const fn segment_length(&self) -> Duration {
        Duration::from_secs(self.segment_secs)
    }

    /// Silence gap as a duration.
    ///
    /// Values that do not fit a `Duration` fall back to the default gap.
    #[must_use]
    pub fn silence_gap(&self) -> Duration {
        Duration::try_from_secs_f64(self.silence_secs.max(0.0)).unwrap_or_else(|_| {
            warn!("Invalid silence gap {}s, using default", self.silence_secs);
            Duration::from_secs_f64(Self::default().silence_secs)
        })
    }
}

/// Device mirroring options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceSyncConfig {
    /// Maximum number of tracks mirrored per playlist (newest first).
    pub playlist_item_limit: usize,
}

impl Default for DeviceSyncConfig {
    fn default() -> Self {
        Self {
            playlist_item_limit: DEFAULT_PLAYLIST_ITEM_LIMIT,
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Root of the local media library.
    pub library_path: PathBuf,
    /// Device discovery settings.
    #[serde(default)]
    pub device: DeviceConfig,
    /// External tool settings.
    #[serde(default)]
    pub tools: ToolConfig,
    /// Audio processing settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Device mirroring settings.
    #[serde(default)]
    pub device_sync: DeviceSyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            library_path: default_library_directory(),
            device: DeviceConfig::default(),
            tools: ToolConfig::default(),
            pipeline: PipelineConfig::default(),
            device_sync: DeviceSyncConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, or create it if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `path`, writing defaults there if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found, using defaults");
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::Storage(StorageError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;

        info!("Loaded config from {}", path.display());
        debug!("Library path: {}", config.library_path.display());

        Ok(config)
    }

    /// Save configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(StorageError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Error::Storage(StorageError::WriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an unparseable value.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    ///
    /// Empty values are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an unparseable value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LIBRARY_PATH") {
            self.library_path = PathBuf::from(v);
        }
        if let Some(v) = get("OPEN_SWIM_SD_PATH") {
            self.device.mount_point = Some(PathBuf::from(v));
        }
        if let Some(v) = get("FFMPEG_PATH") {
            self.tools.ffmpeg_path = v;
        }
        if let Some(v) = get("YTDLP_PATH") {
            self.tools.ytdlp_path = v;
        }
        if let Some(v) = get("PIPER_CMD") {
            self.tools.piper_command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = get("PIPER_VOICE_MODEL_PATH") {
            self.tools.piper_voice_model = PathBuf::from(v);
        }
        if let Some(v) = get("PLAYLIST_SYNC_LIMIT") {
            self.device_sync.playlist_item_limit = v.trim().parse().map_err(|e| {
                Error::Configuration(format!("Invalid PLAYLIST_SYNC_LIMIT '{v}': {e}"))
            })?;
        }

        Ok(())
    }

    /// Get the path to the config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

/// Get the default library directory.
#[must_use]
pub fn default_library_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("openswim")
        .join("library")
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("openswim")
        .join("config.json")
}

/// Validate that a directory is suitable for the library, creating it if needed.
///
/// # Errors
///
/// Returns `Error::Configuration` if the path is relative, not a directory,
/// or not writable.
pub fn validate_library_directory(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Configuration(
            "Library directory must be an absolute path".to_string(),
        ));
    }

    if path.exists() {
        if !path.is_dir() {
            return Err(Error::Configuration(format!(
                "Path exists but is not a directory: {}",
                path.display()
            )));
        }

        let test_file = path.join(".openswim_write_test");
        match fs::write(&test_file, "test") {
            Ok(()) => {
                let _ = fs::remove_file(&test_file);
            }
            Err(e) => {
                return Err(Error::Configuration(format!(
                    "Directory is not writable: {} ({})",
                    path.display(),
                    e
                )));
            }
        }
    } else {
        fs::create_dir_all(path).map_err(|e| {
            Error::Configuration(format!("Cannot create directory {}: {}", path.display(), e))
        })?;
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.library_path.ends_with("openswim/library"));
        assert_eq!(config.device.volume_label, "OpenSwim");
        assert_eq!(config.pipeline.segment_secs, 600);
        assert_eq!(config.device_sync.playlist_item_limit, 20);
        assert_eq!(config.tools.download_timeout_secs, 300);
    }

    #[test]
    fn test_load_creates_default_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");

        let mut config = AppConfig::default();
        config.library_path = temp.path().join("lib");
        config.device.mount_point = Some(PathBuf::from("/mnt/openswim"));
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_sections_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{"library_path": "/data/library", "extra": 1}"#).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.library_path, PathBuf::from("/data/library"));
        assert_eq!(config.tools, ToolConfig::default());
    }

    #[test]
    fn test_invalid_json_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let result = AppConfig::load_from(&path);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LIBRARY_PATH", "/library"),
            ("OPEN_SWIM_SD_PATH", "/mnt/openswim"),
            ("PIPER_CMD", "python3 -m piper"),
            ("FFMPEG_PATH", ""),
            ("PLAYLIST_SYNC_LIMIT", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.library_path, PathBuf::from("/library"));
        assert_eq!(config.device.mount_point, Some(PathBuf::from("/mnt/openswim")));
        assert_eq!(config.tools.piper_command, vec!["python3", "-m", "piper"]);
        // Empty values are ignored
        assert_eq!(config.tools.ffmpeg_path, "ffmpeg");
        assert_eq!(config.device_sync.playlist_item_limit, 5);
    }

    #[test]
    fn test_env_override_invalid_limit() {
        let mut config = AppConfig::default();
        let result = config.apply_overrides(|k| {
            (k == "PLAYLIST_SYNC_LIMIT").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_library_directory() {
        let temp = TempDir::new().unwrap();
        assert!(validate_library_directory(temp.path()).is_ok());

        let new_dir = temp.path().join("library");
        assert!(validate_library_directory(&new_dir).is_ok());
        assert!(new_dir.is_dir());

        assert!(validate_library_directory(Path::new("relative/path")).is_err());

        let file = temp.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(validate_library_directory(&file).is_err());
    }

    #[test]
    fn test_durations() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.segment_length(), Duration::from_secs(600));
        assert_eq!(config.pipeline.silence_gap(), Duration::from_millis(500));
        assert_eq!(config.device.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_silence_gap_out_of_range_uses_default() {
        let default_gap = PipelineConfig::default().silence_gap();
        for secs in [f64::INFINITY, f64::MAX, 1e300] {
            let config = PipelineConfig {
                silence_secs: secs,
                ..PipelineConfig::default()
            };
            assert_eq!(config.silence_gap(), default_gap);
        }

        let negative = PipelineConfig {
            silence_secs: -3.0,
            ..PipelineConfig::default()
        };
        assert_eq!(negative.silence_gap(), Duration::ZERO);
    }
}
