//! Interactive sessions and fan-out command execution.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{AgentChannel, CommandStatus, RemoteCommand, SessionEnd};
use crate::config::Policy;
use crate::error::OpsError;
use crate::operation::OperationId;
use crate::pool::{FanOutReport, Slot, fan_out};
use crate::retry::{RetryBudget, with_retries};
use crate::target::Target;

/// A command to run on one or many targets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandRequest {
    /// Script in the targets' shell dialect.
    pub command: String,
    /// Per-target time budget.
    pub timeout: Duration,
    /// Optional working directory.
    pub working_dir: Option<String>,
}

impl CommandRequest {
    /// Creates a request without a working directory.
    #[must_use]
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            working_dir: None,
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Outcome of a command on one target.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CommandResult {
    /// Target the command ran on.
    pub target: Target,
    /// Exit code, when one was reported.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, or the delivery failure.
    pub stderr: String,
    /// Terminal status.
    pub status: CommandStatus,
}

impl CommandResult {
    /// Returns `true` for [`CommandStatus::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, CommandStatus::Success)
    }

    fn undelivered(target: Target, status: CommandStatus, reason: String) -> Self {
        Self {
            target,
            exit_code: None,
            stdout: String::new(),
            stderr: reason,
            status,
        }
    }
}

/// Opens sessions and runs commands through the agent channel.
#[derive(Clone)]
pub struct Executor {
    agent: Arc<dyn AgentChannel>,
    policy: Policy,
}

impl Executor {
    /// Creates an executor.
    #[must_use]
    pub fn new(agent: Arc<dyn AgentChannel>, policy: Policy) -> Self {
        Self { agent, policy }
    }

    /// Checks `0 < timeout <= max_command_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::InvalidDuration`] when the timeout is out of range.
    pub fn validate(&self, request: &CommandRequest) -> Result<(), OpsError> {
        let max = self.policy.max_command_timeout;
        if request.timeout.is_zero() || request.timeout > max {
            return Err(OpsError::InvalidDuration {
                value: request.timeout,
                max,
            });
        }
        Ok(())
    }

    /// Opens an interactive session and blocks until it ends.
    ///
    /// Disconnects are not retried; a human is present and decides.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::Session`] when the agent drops the session or it
    /// cannot be opened, and [`OpsError::Cancelled`] on cancellation.
    pub async fn open_session(
        &self,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, OpsError> {
        let ended = self
            .agent
            .open_session(target, cancel)
            .await
            .map_err(|err| {
                OpsError::from_backend(err, &target.region, |other| OpsError::Session {
                    message: other.to_string(),
                })
            })?;
        match ended {
            SessionEnd::Terminated(Some(code)) if code != 0 => Err(OpsError::Session {
                message: format!("agent terminated the session with status {code}"),
            }),
            SessionEnd::Cancelled => Err(OpsError::Cancelled),
            other => {
                info!(target = %target, "session closed");
                Ok(other)
            }
        }
    }

    /// Runs `request` on every target with bounded concurrency.
    ///
    /// A single target that times out yields [`OpsError::Timeout`]; a
    /// non-zero exit is an ordinary result. With several targets, any
    /// result other than success yields [`OpsError::PartialFailure`]
    /// carrying every result.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::InvalidDuration`] before any network call when the
    /// timeout is out of range, and [`OpsError::Cancelled`] on cancellation.
    pub async fn run(
        &self,
        operation_id: OperationId,
        targets: Vec<Target>,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<FanOutReport<CommandResult>, OpsError> {
        self.validate(request)?;
        let single = targets.len() == 1;
        let deadline = self.fan_out_deadline(targets.len(), request.timeout);
        let budget = RetryBudget::from_policy(&self.policy);
        let command = Arc::new(RemoteCommand {
            script: request.command.clone(),
            working_dir: request.working_dir.clone(),
            timeout: request.timeout,
        });

        let pending = targets.clone();
        let slots = fan_out(
            targets,
            self.policy.max_concurrency,
            deadline,
            cancel,
            |target| {
                let agent = Arc::clone(&self.agent);
                let shared = Arc::clone(&command);
                run_on_target(agent, target, shared, budget, cancel.child_token())
            },
        )
        .await
        .map_err(|_| OpsError::Cancelled)?;

        let results = slots
            .into_iter()
            .zip(pending)
            .map(|(slot, target)| match slot {
                Slot::Done(result) => result,
                Slot::Expired => CommandResult::undelivered(
                    target,
                    CommandStatus::TimedOut,
                    String::from("fan-out deadline elapsed"),
                ),
                Slot::Crashed(reason) => {
                    CommandResult::undelivered(target, CommandStatus::Failed, reason)
                }
            })
            .collect::<Vec<_>>();

        let report = FanOutReport {
            operation_id,
            results,
        };
        if single {
            if let Some(only) = report.results.first()
                && only.status == CommandStatus::TimedOut
            {
                return Err(OpsError::Timeout {
                    activity: format!("command on {}", only.target),
                    after: request.timeout,
                });
            }
            return Ok(report);
        }
        if report.results.iter().any(|result| !result.is_success()) {
            return Err(OpsError::PartialFailure { report });
        }
        Ok(report)
    }

    fn fan_out_deadline(&self, targets: usize, timeout: Duration) -> Instant {
        let rounds = targets.div_ceil(self.policy.max_concurrency.max(1)).max(1);
        let waves = u32::try_from(rounds).unwrap_or(u32::MAX);
        Instant::now() + timeout.saturating_mul(waves) + self.policy.fanout_grace
    }
}

async fn run_on_target(
    agent: Arc<dyn AgentChannel>,
    target: Target,
    command: Arc<RemoteCommand>,
    budget: RetryBudget,
    cancel: CancellationToken,
) -> CommandResult {
    if !target.is_reachable() {
        let reason = format!("agent is not reachable ({:?})", target.agent);
        warn!(target = %target, "skipping unreachable target");
        return CommandResult::undelivered(target, CommandStatus::Failed, reason);
    }

    let attempt = with_retries(budget, "run_command", &cancel, || {
        agent.run_command(&target, &command, &cancel)
    });
    let outcome = tokio::time::timeout(command.timeout, attempt).await;
    // Stops any agent-side polling still tied to this target.
    cancel.cancel();

    match outcome {
        Err(_elapsed) => {
            warn!(target = %target, "command timed out");
            CommandResult::undelivered(
                target,
                CommandStatus::TimedOut,
                format!("no terminal status after {}s", command.timeout.as_secs()),
            )
        }
        Ok(Err(err)) => {
            warn!(target = %target, error = %err, "command could not be delivered");
            CommandResult::undelivered(target, CommandStatus::Failed, err.to_string())
        }
        Ok(Ok(invocation)) => {
            info!(target = %target, status = ?invocation.status, exit_code = ?invocation.exit_code, "command finished");
            CommandResult {
                target,
                exit_code: invocation.exit_code,
                stdout: invocation.stdout,
                stderr: invocation.stderr,
                status: invocation.status,
            }
        }
    }
}
