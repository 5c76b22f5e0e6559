//! Media pipelines and the external tools they drive.
//!
//! - [`command`]: timed execution of external programs
//! - [`tools`]: the [`MediaTools`] seam and its real implementation
//! - [`MediaPipeline`]: `ensure_track` / `ensure_episode` and their batch forms
//! - [`lookup`]: playlist descriptions answered outside the sync queue

pub mod command;
mod episode;
pub mod lookup;
mod pipeline;
pub mod tools;
mod track;

pub use command::{CommandRunner, SystemCommandRunner, ToolInvocation, ToolOutput};
pub use episode::segment_intro_text;
pub use pipeline::{BatchSummary, ItemOutcome, MediaPipeline};
pub use lookup::{PlaylistInfoResponse, lookup_playlist, playlist_id_from_input};
pub use tools::{ExternalMediaTools, MediaTools, PlaylistInfo};
