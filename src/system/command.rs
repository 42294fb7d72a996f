//! Privileged command runner
//!
//! `wg` and `iptables` are driven as external programs. [`ProcessRunner`]
//! spawns them through tokio (optionally behind `sudo -n`) with a hard
//! timeout; [`RecordingCommandRunner`] captures invocations for tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, trace};

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Error types for command execution
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    /// Program could not be started
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// Program did not finish in time
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// Program exited unsuccessfully
    #[error("{program} exited with {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    /// Spawn failures mean a missing binary or privilege; the rest may be transient
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Spawn { .. })
    }

    /// Captured stderr, if the program ran
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful empty output
    pub fn ok() -> Self {
        Self {
            status: Some(0),
            ..Self::default()
        }
    }

    /// Failed output with the given code and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Executes local programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output, whatever the exit status
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;

    /// Run and turn a non-zero exit into `CommandError::Failed`
    async fn run_checked(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, CommandError> {
        let output = self.run(program, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                program: program.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs commands as child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    use_sudo: bool,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(use_sudo: bool, timeout: Duration) -> Self {
        Self { use_sudo, timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(false, DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let mut command = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(program);
            c
        } else {
            Command::new(program)
        };
        command.args(args).kill_on_drop(true);

        debug!(program, args = ?args, sudo = self.use_sudo, "Running command");

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| CommandError::Timeout {
                program: program.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| CommandError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(program, status = ?result.status, "Command finished");
        Ok(result)
    }
}

/// One recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Program and arguments joined by spaces
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Test runner that records invocations and replays scripted outputs
///
/// Outputs queued with [`push_output`](Self::push_output) are returned in
/// order; once the queue is empty every command succeeds.
#[derive(Default)]
pub struct RecordingCommandRunner {
    invocations: Mutex<Vec<Invocation>>,
    outputs: Mutex<VecDeque<Result<CommandOutput, CommandError>>>,
}

impl RecordingCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next command
    pub fn push_output(&self, output: Result<CommandOutput, CommandError>) {
        self.outputs.lock().push_back(output);
    }

    /// Everything run so far
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// Command lines run so far
    pub fn command_lines(&self) -> Vec<String> {
        self.invocations
            .lock()
            .iter()
            .map(Invocation::command_line)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        self.invocations.lock().push(Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        });
        self.outputs
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::ok()))
    }
}
