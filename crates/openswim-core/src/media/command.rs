//! Running external tools with a timeout.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::debug;

use crate::error::{Error, Result, ToolError};

/// Maximum number of stderr characters kept in a failure diagnostic.
const STDERR_TAIL_CHARS: usize = 800;

/// One external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Short tool name used in diagnostics (`ffmpeg`, `yt-dlp`, `piper`).
    pub tool: String,
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<OsString>,
    /// Hard limit on the run time; the process is killed when it elapses.
    pub timeout: Duration,
}

impl ToolInvocation {
    /// Create an invocation with no arguments.
    #[must_use]
    pub fn new(tool: impl Into<String>, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command line for log output.
    #[must_use]
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Captured output of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Executes tool invocations.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, failing on non-zero exit or timeout.
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Runs commands as child processes on the tokio runtime.
///
/// `run` blocks the calling thread, so it must be called from a blocking
/// context (a `spawn_blocking` task or a plain thread), never from inside
/// an async task.
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    runtime: Handle,
}

impl SystemCommandRunner {
    /// Create a runner driving processes on `runtime`.
    #[must_use]
    pub const fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Create a runner on the runtime of the current context.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` when called outside a tokio runtime.
    pub fn from_current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Configuration(format!("No tokio runtime available: {e}")))
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        self.runtime.block_on(run_with_timeout(invocation))
    }
}

async fn run_with_timeout(invocation: &ToolInvocation) -> Result<ToolOutput> {
    debug!("Running {}", invocation.display());

    let child = tokio::process::Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::SpawnFailed {
            tool: invocation.tool.clone(),
            reason: e.to_string(),
        })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let output = tokio::time::timeout(invocation.timeout, child.wait_with_output())
        .await
        .map_err(|_| ToolError::TimedOut {
            tool: invocation.tool.clone(),
            secs: invocation.timeout.as_secs(),
        })?
        .map_err(|e| ToolError::SpawnFailed {
            tool: invocation.tool.clone(),
            reason: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool: invocation.tool.clone(),
            code: output.status.code(),
            stderr: stderr_tail(&stderr),
        }
        .into());
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Last part of stderr, trimmed, for diagnostics.
fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}
