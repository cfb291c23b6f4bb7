//! Hardware process invocation
//!
//! Vendor flash and configuration tools are plain executables. The runner
//! starts them with a bounded timeout and captures their output line by
//! line so steps can surface the tail in failure messages.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ControlError, Result};

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new(executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            timeout,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command line for logs
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.args.join(" "))
        }
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ProcessOutput {
    pub fn new(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, line: impl Into<String>) -> Self {
        self.stdout.push(line.into());
        self
    }

    pub fn with_stderr(mut self, line: impl Into<String>) -> Self {
        self.stderr.push(line.into());
        self
    }

    /// Last `lines` lines of stderr, falling back to stdout when stderr is empty
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let start = source.len().saturating_sub(lines);
        source[start..].join("\n")
    }
}

/// Runs hardware tooling on the local host
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput>;
}

/// Runner backed by `tokio::process`
///
/// The child is killed if it outlives `spec.timeout`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| line.trim_end().to_string())
        .collect()
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput> {
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        debug!(command = %spec.command_line(), timeout = ?spec.timeout, "Spawning process");

        let output = match tokio::time::timeout(spec.timeout, command.output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(command = %spec.command_line(), timeout = ?spec.timeout, "Process timed out");
                return Err(ControlError::Timeout(format!(
                    "'{}' did not exit within {:?}",
                    spec.executable, spec.timeout
                )));
            }
        };

        // Killed by a signal: no exit code
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(ProcessOutput {
            exit_code,
            stdout: split_lines(&output.stdout),
            stderr: split_lines(&output.stderr),
        })
    }
}
