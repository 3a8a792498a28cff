//! External process execution and the runner abstraction.
//!
//! Every control-plane and agent call in the AWS backends is an invocation of
//! the `aws` CLI. Routing those invocations through [`CommandRunner`] keeps
//! the backends testable with scripted fakes and gives cancellation a single
//! place to terminate child processes.

use std::ffi::OsString;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendFuture;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status, `unknown` when the process was signalled.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// How an attached (terminal-inheriting) process finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachedExit {
    /// The process exited on its own with the given code.
    Exited(Option<i32>),
    /// The caller cancelled and the process was killed.
    Cancelled,
}

/// Errors raised while starting or supervising a process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when waiting on a running child fails.
    #[error("failed to wait for {program}: {message}")]
    Wait {
        /// Command being supervised.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// Dropping the returned future terminates the child process.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> BackendFuture<'a, CommandOutput, RunnerError>;

    /// Runs `program` attached to the caller's terminal until it exits or
    /// `cancel` fires.
    fn run_attached<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, AttachedExit, RunnerError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> BackendFuture<'a, CommandOutput, RunnerError> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| RunnerError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn run_attached<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, AttachedExit, RunnerError> {
        Box::pin(async move {
            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| RunnerError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            tokio::select! {
                waited = child.wait() => {
                    let status = waited.map_err(|err| RunnerError::Wait {
                        program: program.to_owned(),
                        message: err.to_string(),
                    })?;
                    Ok(AttachedExit::Exited(status.code()))
                }
                () = cancel.cancelled() => {
                    // Already-exited children make kill fail; that is fine.
                    let _ignored = child.kill().await;
                    Ok(AttachedExit::Cancelled)
                }
            }
        })
    }
}
