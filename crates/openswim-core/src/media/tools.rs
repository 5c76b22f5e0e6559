//! Audio tool collaborators.
//!
//! [`MediaTools`] is the seam between the pipelines and the outside world.
//! [`ExternalMediaTools`] implements it with yt-dlp, ffmpeg, piper and a
//! plain HTTP client.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{PipelineConfig, ToolConfig};
use crate::error::{Error, Result, ToolError, delete_error, write_error};
use crate::library::list_mp3_files;
use crate::media::command::{CommandRunner, ToolInvocation};
use crate::requests::TrackRequest;

/// External operations the pipelines depend on.
///
/// Every method either produces its documented output file or fails.
#[cfg_attr(test, mockall::automock)]
pub trait MediaTools: Send + Sync {
    /// Download the audio of a YouTube video as mp3 to `output`.
    fn download_track(&self, video_id: &str, output: &Path) -> Result<()>;

    /// Describe a YouTube playlist, its videos in playlist order.
    fn list_playlist(&self, playlist_id: &str) -> Result<PlaylistInfo>;

    /// Download an episode from `url` to `output`.
    fn download_episode(&self, url: &str, output: &Path) -> Result<()>;

    /// Loudness-normalize `input` into `output`.
    fn normalize_loudness(&self, input: &Path, output: &Path) -> Result<()>;

    /// Speak `text` into an mp3 at `output`.
    fn synthesize_speech(&self, text: &str, output: &Path) -> Result<()>;

    /// Write `duration` of silence as mp3 to `output`.
    fn generate_silence(&self, duration: Duration, output: &Path) -> Result<()>;

    /// Join `inputs` in order into `output`.
    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;

    /// Split `input` into fixed-length segments in `output_dir`, returned in order.
    fn split_into_segments(
        &self,
        input: &Path,
        segment_length: Duration,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>>;
}

/// A playlist as listed by YouTube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistInfo {
    /// Playlist identifier.
    pub id: String,
    /// Playlist title.
    pub title: String,
    /// Videos in playlist order.
    pub tracks: Vec<TrackRequest>,
}

/// Flat playlist listing as printed by `yt-dlp --dump-single-json`.
#[derive(Debug, Deserialize)]
struct PlaylistListing {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    entries: Vec<PlaylistEntry>,
}

#[derive(Debug, Deserialize)]
struct PlaylistEntry {
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// [`MediaTools`] backed by real programs.
#[derive(Clone)]
pub struct ExternalMediaTools {
    runner: Arc<dyn CommandRunner>,
    tools: ToolConfig,
    audio: PipelineConfig,
}

impl ExternalMediaTools {
    /// Create the tool set.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolConfig, audio: PipelineConfig) -> Self {
        Self {
            runner,
            tools,
            audio,
        }
    }

    const fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.transcode_timeout_secs)
    }

    fn ffmpeg(&self) -> ToolInvocation {
        ToolInvocation::new("ffmpeg", &self.tools.ffmpeg_path, self.transcode_timeout())
            .args(["-hide_banner", "-loglevel", "error"])
    }

    fn ytdlp(&self) -> ToolInvocation {
        ToolInvocation::new(
            "yt-dlp",
            &self.tools.ytdlp_path,
            Duration::from_secs(self.tools.download_timeout_secs),
        )
    }

    fn encode_args(&self) -> [String; 4] {
        [
            "-codec:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            self.audio.bitrate.clone(),
        ]
    }

    fn run(&self, invocation: &ToolInvocation, output: &Path) -> Result<()> {
        self.runner.run(invocation)?;
        expect_output(&invocation.tool, output)
    }
}

impl MediaTools for ExternalMediaTools {
    fn download_track(&self, video_id: &str, output: &Path) -> Result<()> {
        info!("Downloading video {}", video_id);
        let invocation = self
            .ytdlp()
            .args(["-x", "--audio-format", "mp3", "--audio-quality", "0", "-o"])
            .arg(output)
            .arg(format!("https://www.youtube.com/watch?v={video_id}"));
        self.run(&invocation, output)
    }

    fn list_playlist(&self, playlist_id: &str) -> Result<PlaylistInfo> {
        let invocation = self
            .ytdlp()
            .args(["--flat-playlist", "--dump-single-json"])
            .arg(format!("https://www.youtube.com/playlist?list={playlist_id}"));
        let output = self.runner.run(&invocation)?;

        let listing: PlaylistListing =
            serde_json::from_str(&output.stdout).map_err(|e| ToolError::Failed {
                tool: "yt-dlp".to_string(),
                code: Some(0),
                stderr: format!("unreadable playlist listing: {e}"),
            })?;

        let tracks: Vec<TrackRequest> = listing
            .entries
            .into_iter()
            .filter_map(|entry| {
                let id = entry.id.filter(|id| !id.is_empty())?;
                let title = entry.title.unwrap_or_else(|| id.clone());
                Some(TrackRequest { id, title })
            })
            .collect();

        debug!("Playlist {} lists {} videos", playlist_id, tracks.len());
        Ok(PlaylistInfo {
            id: listing
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| playlist_id.to_string()),
            title: listing
                .title
                .unwrap_or_else(|| "Unknown Playlist".to_string()),
            tracks,
        })
    }

    fn download_episode(&self, url: &str, output: &Path) -> Result<()> {
        info!("Downloading episode from {}", url);
        let http_error = |reason: String| {
            Error::Tool(ToolError::Http {
                url: url.to_string(),
                reason,
            })
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.tools.http_timeout_secs))
            .build()
            .map_err(|e| http_error(e.to_string()))?;

        let mut response = client
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|e| http_error(e.to_string()))?;

        let mut file = File::create(output).map_err(|e| write_error(output, &e))?;
        response
            .copy_to(&mut file)
            .map_err(|e| http_error(e.to_string()))?;

        expect_output("http", output)
    }

    fn normalize_loudness(&self, input: &Path, output: &Path) -> Result<()> {
        let filter = format!(
            "loudnorm=I={}:TP={}:LRA={}",
            self.audio.loudness_target, self.audio.true_peak, self.audio.loudness_range
        );
        let invocation = self
            .ffmpeg()
            .arg("-i")
            .arg(input)
            .args(["-af", filter.as_str(), "-b:a", self.audio.bitrate.as_str(), "-y"])
            .arg(output);
        self.run(&invocation, output)
    }

    fn synthesize_speech(&self, text: &str, output: &Path) -> Result<()> {
        let Some((program, fixed_args)) = self.tools.piper_command.split_first() else {
            return Err(Error::Configuration(
                "Speech synthesizer command is empty".to_string(),
            ));
        };

        let wav = output.with_extension("wav");
        let speech = ToolInvocation::new(
            "piper",
            program,
            Duration::from_secs(self.tools.speech_timeout_secs),
        )
        .args(fixed_args.iter().map(String::as_str))
        .arg("-m")
        .arg(&self.tools.piper_voice_model)
        .arg("-f")
        .arg(&wav)
        .arg("--")
        .arg(text);
        self.run(&speech, &wav)?;

        let encode = self
            .ffmpeg()
            .arg("-i")
            .arg(&wav)
            .args(self.encode_args())
            .arg("-y")
            .arg(output);
        let result = self.run(&encode, output);

        if let Err(e) = fs::remove_file(&wav) {
            debug!("Could not remove {}: {}", wav.display(), e);
        }
        result
    }

    fn generate_silence(&self, duration: Duration, output: &Path) -> Result<()> {
        let invocation = self
            .ffmpeg()
            .args(["-f", "lavfi", "-i", "anullsrc=r=44100:cl=stereo", "-t"])
            .arg(format!("{:.3}", duration.as_secs_f64()))
            .args(self.encode_args())
            .arg("-y")
            .arg(output);
        self.run(&invocation, output)
    }

    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let list_path = output.with_extension("concat.txt");
        let listing: String = inputs
            .iter()
            .map(|p| {
                let absolute = std::path::absolute(p).unwrap_or_else(|_| p.clone());
                format!(
                    "file '{}'\n",
                    absolute.to_string_lossy().replace('\'', r"'\''")
                )
            })
            .collect();
        fs::write(&list_path, listing).map_err(|e| write_error(&list_path, &e))?;

        let invocation = self
            .ffmpeg()
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(self.encode_args())
            .arg("-y")
            .arg(output);
        let result = self.run(&invocation, output);

        fs::remove_file(&list_path).map_err(|e| delete_error(&list_path, &e))?;
        result
    }

    fn split_into_segments(
        &self,
        input: &Path,
        segment_length: Duration,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let invocation = self
            .ffmpeg()
            .arg("-i")
            .arg(input)
            .args(["-f", "segment", "-segment_time"])
            .arg(segment_length.as_secs().to_string())
            .args(["-c", "copy"])
            .arg(output_dir.join("segment_%03d.mp3"));
        self.runner.run(&invocation)?;

        let segments: Vec<PathBuf> = list_mp3_files(output_dir)
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("segment_"))
            })
            .collect();

        debug!("Split {} into {} segments", input.display(), segments.len());
        Ok(segments)
    }
}

fn expect_output(tool: &str, output: &Path) -> Result<()> {
    if output.is_file() {
        Ok(())
    } else {
        Err(ToolError::MissingOutput {
            tool: tool.to_string(),
            path: output.to_path_buf(),
        }
        .into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::ffi::OsString;

    use super::*;
    use crate::media::command::{MockCommandRunner, ToolOutput};
    use tempfile::TempDir;

    fn tools_with(runner: MockCommandRunner) -> ExternalMediaTools {
        ExternalMediaTools::new(
            Arc::new(runner),
            ToolConfig::default(),
            PipelineConfig::default(),
        )
    }

    fn has_arg(inv: &ToolInvocation, arg: &str) -> bool {
        inv.args.iter().any(|a| a == &OsString::from(arg))
    }

    /// Runner that creates the file following `flag` (or the last argument).
    fn touching_runner(flag: Option<&'static str>) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |inv| {
            let target = match flag {
                Some(flag) => {
                    let pos = inv.args.iter().position(|a| a == flag).unwrap();
                    PathBuf::from(&inv.args[pos + 1])
                }
                None => PathBuf::from(inv.args.last().unwrap()),
            };
            fs::write(target, b"audio").unwrap();
            Ok(ToolOutput::default())
        });
        runner
    }

    #[test]
    fn test_download_track_invocation() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("v1.mp3");

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| {
                inv.tool == "yt-dlp"
                    && has_arg(inv, "-x")
                    && has_arg(inv, "https://www.youtube.com/watch?v=v1")
                    && inv.timeout == Duration::from_secs(300)
            })
            .times(1)
            .returning(|inv| {
                let pos = inv.args.iter().position(|a| a == "-o").unwrap();
                fs::write(PathBuf::from(&inv.args[pos + 1]), b"audio").unwrap();
                Ok(ToolOutput::default())
            });

        tools_with(runner).download_track("v1", &output).unwrap();
        assert!(output.exists());
    }

    #[test]
    fn test_zero_exit_without_output_is_failure() {
        let temp = TempDir::new().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(ToolOutput::default()));

        let err = tools_with(runner)
            .normalize_loudness(&temp.path().join("in.mp3"), &temp.path().join("out.mp3"))
            .unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::MissingOutput { .. })));
    }

    #[test]
    fn test_normalize_uses_loudnorm_filter() {
        let temp = TempDir::new().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| has_arg(inv, "loudnorm=I=-16:TP=-1.5:LRA=11") && has_arg(inv, "128k"))
            .returning(|inv| {
                fs::write(PathBuf::from(inv.args.last().unwrap()), b"x").unwrap();
                Ok(ToolOutput::default())
            });

        tools_with(runner)
            .normalize_loudness(&temp.path().join("in.mp3"), &temp.path().join("out.mp3"))
            .unwrap();
    }

    #[test]
    fn test_list_playlist_parses_flat_listing() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(ToolOutput {
                stdout: r#"{"id": "p1", "title": "Laps", "entries": [
                    {"id": "v1", "title": "Song A"},
                    {"id": null, "title": "Deleted"},
                    {"id": "v2"}
                ]}"#
                .to_string(),
                stderr: String::new(),
            })
        });

        let info = tools_with(runner).list_playlist("p1").unwrap();
        assert_eq!(info.id, "p1");
        assert_eq!(info.title, "Laps");
        assert_eq!(info.tracks.len(), 2);
        assert_eq!(info.tracks[1].title, "v2");
    }

    #[test]
    fn test_speech_runs_piper_then_encodes() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("intro.mp3");

        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .withf(|inv| inv.tool == "piper" && has_arg(inv, "Song A"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|inv| {
                let pos = inv.args.iter().position(|a| a == "-f").unwrap();
                fs::write(PathBuf::from(&inv.args[pos + 1]), b"wav").unwrap();
                Ok(ToolOutput::default())
            });
        runner
            .expect_run()
            .withf(|inv| inv.tool == "ffmpeg" && has_arg(inv, "libmp3lame"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|inv| {
                fs::write(PathBuf::from(inv.args.last().unwrap()), b"mp3").unwrap();
                Ok(ToolOutput::default())
            });

        tools_with(runner).synthesize_speech("Song A", &output).unwrap();
        assert!(output.exists());
        assert!(!temp.path().join("intro.wav").exists());
    }

    #[test]
    fn test_concatenate_writes_list_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("joined.mp3");
        let inputs = vec![temp.path().join("a.mp3"), temp.path().join("it's.mp3")];

        let list_path = output.with_extension("concat.txt");
        let expected_list = list_path.clone();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(move |inv| {
            let listing = fs::read_to_string(&expected_list).unwrap();
            assert!(listing.contains("a.mp3'"));
            assert!(listing.contains(r"it'\''s.mp3"));
            fs::write(PathBuf::from(inv.args.last().unwrap()), b"x").unwrap();
            Ok(ToolOutput::default())
        });

        tools_with(runner).concatenate(&inputs, &output).unwrap();
        assert!(!list_path.exists());
    }

    #[test]
    fn test_split_collects_sorted_segments() {
        let temp = TempDir::new().unwrap();
        let out_dir = temp.path().to_path_buf();

        let mut runner = MockCommandRunner::new();
        let dir = out_dir.clone();
        runner.expect_run().times(1).returning(move |_| {
            for name in ["segment_001.mp3", "segment_000.mp3", "other.mp3"] {
                fs::write(dir.join(name), b"x").unwrap();
            }
            Ok(ToolOutput::default())
        });

        let segments = tools_with(runner)
            .split_into_segments(&temp.path().join("ep.mp3"), Duration::from_secs(600), &out_dir)
            .unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments[0].ends_with("segment_000.mp3"));
    }

    #[test]
    fn test_silence_creates_output() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("silence.mp3");
        tools_with(touching_runner(None))
            .generate_silence(Duration::from_millis(500), &output)
            .unwrap();
        assert!(output.exists());
    }

    #[test]
    fn test_empty_piper_command_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let mut config = ToolConfig::default();
        config.piper_command.clear();
        let tools = ExternalMediaTools::new(
            Arc::new(MockCommandRunner::new()),
            config,
            PipelineConfig::default(),
        );
        let err = tools
            .synthesize_speech("hi", &temp.path().join("x.mp3"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
