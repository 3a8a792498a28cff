//! Systems Manager agent channel.

use std::ffi::OsString;
use std::io::Write as _;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::scripts::{
    MISSING_FILE_EXIT, parse_report, pull_script, push_script, read_script, stat_script,
    write_script,
};
use super::{AwsBackend, DIRECT_PAYLOAD_LIMIT, parse_json};
use crate::backend::{
    AgentChannel, BackendError, BackendFuture, CommandInvocation, CommandStatus, PortPair,
    RelayLocation, RemoteCommand, RemoteFile, SessionEnd,
};
use crate::command::{AttachedExit, CommandRunner};
use crate::target::{Platform, Target};

/// Agent-side execution limit for transfer scripts.
const TRANSFER_SCRIPT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandResponse {
    command: SentCommand,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SentCommand {
    command_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvocationResponse {
    status: String,
    #[serde(default)]
    status_details: String,
    #[serde(default)]
    response_code: Option<i32>,
    #[serde(default)]
    standard_output_content: String,
    #[serde(default)]
    standard_error_content: String,
}

impl InvocationResponse {
    /// Maps a finished invocation; `None` while it is still running.
    fn into_terminal(self) -> Option<CommandInvocation> {
        let status = match (self.status.as_str(), self.status_details.as_str()) {
            (_, "ExecutionTimedOut") => CommandStatus::TimedOut,
            ("Success", _) => CommandStatus::Success,
            ("TimedOut", "DeliveryTimedOut") | ("Failed" | "Cancelled", _) => {
                CommandStatus::Failed
            }
            ("TimedOut", _) => CommandStatus::TimedOut,
            _ => return None,
        };
        Some(CommandInvocation {
            exit_code: self.response_code.filter(|code| *code >= 0),
            stdout: self.standard_output_content,
            stderr: self.standard_error_content,
            status,
        })
    }
}

const fn document_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Linux => "AWS-RunShellScript",
        Platform::Windows => "AWS-RunPowerShellScript",
    }
}

fn parameters(command: &RemoteCommand) -> serde_json::Value {
    let lines = command.script.lines().collect::<Vec<_>>();
    let timeout = command.timeout.as_secs().max(1).to_string();
    match &command.working_dir {
        Some(dir) => json!({
            "commands": lines,
            "executionTimeout": [timeout],
            "workingDirectory": [dir],
        }),
        None => json!({
            "commands": lines,
            "executionTimeout": [timeout],
        }),
    }
}

const fn session_end(exit: AttachedExit) -> SessionEnd {
    match exit {
        AttachedExit::Exited(Some(0)) => SessionEnd::Closed,
        AttachedExit::Exited(code) => SessionEnd::Terminated(code),
        AttachedExit::Cancelled => SessionEnd::Cancelled,
    }
}

impl<R: CommandRunner> AwsBackend<R> {
    async fn send_command(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<String, BackendError> {
        let mut document = tempfile::Builder::new()
            .prefix("gangway-ssm-")
            .suffix(".json")
            .tempfile()
            .map_err(|err| local_io("parameters file", &err))?;
        let body = parameters(command).to_string();
        document
            .write_all(body.as_bytes())
            .map_err(|err| local_io("parameters file", &err))?;
        let path = document.path().to_string_lossy().into_owned();

        let response: SendCommandResponse = self
            .call_json(
                &target.region,
                "send-command",
                vec![
                    String::from("ssm"),
                    String::from("send-command"),
                    String::from("--instance-ids"),
                    target.id.clone(),
                    String::from("--document-name"),
                    document_name(target.platform).to_owned(),
                    String::from("--comment"),
                    String::from("gangway"),
                    String::from("--parameters"),
                    format!("file://{path}"),
                ],
            )
            .await?;
        debug!(target = %target.id, command_id = %response.command.command_id, "command sent");
        Ok(response.command.command_id)
    }

    async fn poll_invocation(
        &self,
        target: &Target,
        command_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandInvocation, BackendError> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.cancel_command(target, command_id).await;
                    return Err(BackendError::Cancelled);
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
            let polled = self
                .call(
                    &target.region,
                    "command invocation",
                    vec![
                        String::from("ssm"),
                        String::from("get-command-invocation"),
                        String::from("--command-id"),
                        command_id.to_owned(),
                        String::from("--instance-id"),
                        target.id.clone(),
                    ],
                )
                .await;
            match polled {
                Ok(stdout) => {
                    let response: InvocationResponse = parse_json("command invocation", &stdout)?;
                    if let Some(done) = response.into_terminal() {
                        return Ok(done);
                    }
                }
                // The invocation is not visible right after sending, and a
                // throttled poll must not resend the command.
                Err(err @ (BackendError::NotFound { .. } | BackendError::Transient { .. })) => {
                    debug!(target = %target.id, command_id, error = %err, "invocation not ready");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn cancel_command(&self, target: &Target, command_id: &str) {
        let outcome = self
            .call(
                &target.region,
                "cancel-command",
                vec![
                    String::from("ssm"),
                    String::from("cancel-command"),
                    String::from("--command-id"),
                    command_id.to_owned(),
                    String::from("--instance-ids"),
                    target.id.clone(),
                ],
            )
            .await;
        if let Err(err) = outcome {
            warn!(target = %target.id, command_id, error = %err, "failed to cancel remote command");
        }
    }

    async fn execute(
        &self,
        target: &Target,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandInvocation, BackendError> {
        let command_id = self.send_command(target, command).await?;
        self.poll_invocation(target, &command_id, cancel).await
    }

    /// Runs a transfer script, returning stdout when it succeeded.
    async fn run_script(
        &self,
        target: &Target,
        activity: &str,
        path: &str,
        script: String,
    ) -> Result<String, BackendError> {
        let command = RemoteCommand {
            script,
            working_dir: None,
            timeout: TRANSFER_SCRIPT_TIMEOUT,
        };
        let invocation = self
            .execute(target, &command, &CancellationToken::new())
            .await?;
        match invocation.status {
            CommandStatus::Success => Ok(invocation.stdout),
            _ if invocation.exit_code == Some(MISSING_FILE_EXIT) => {
                Err(BackendError::not_found("remote file", path))
            }
            _ => Err(BackendError::CommandFailure {
                program: format!("{activity} on {}", target.id),
                status: invocation.exit_code,
                status_text: invocation
                    .exit_code
                    .map_or_else(|| String::from("unknown"), |code| code.to_string()),
                stderr: invocation.stderr.trim().to_owned(),
            }),
        }
    }

    async fn run_reporting_script(
        &self,
        target: &Target,
        activity: &str,
        path: &str,
        script: String,
    ) -> Result<RemoteFile, BackendError> {
        let stdout = self.run_script(target, activity, path, script).await?;
        parse_report(&stdout).ok_or_else(|| BackendError::Parse {
            resource: format!("{activity} report"),
            message: format!("expected '<bytes> <sha256>', got {:?}", stdout.trim()),
        })
    }

    fn session_args(&self, target: &Target, extra: &[String]) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("ssm"),
            OsString::from("start-session"),
            OsString::from("--target"),
            OsString::from(&target.id),
        ];
        args.extend(extra.iter().map(OsString::from));
        args.push(OsString::from("--region"));
        args.push(OsString::from(&target.region));
        if let Some(profile) = &self.profile {
            args.push(OsString::from("--profile"));
            args.push(OsString::from(profile));
        }
        args
    }
}

fn local_io(path: &str, err: &std::io::Error) -> BackendError {
    BackendError::Io {
        path: path.to_owned(),
        message: err.to_string(),
    }
}

impl<R: CommandRunner> AgentChannel for AwsBackend<R> {
    fn run_command<'a>(
        &'a self,
        target: &'a Target,
        command: &'a RemoteCommand,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, CommandInvocation, BackendError> {
        Box::pin(self.execute(target, command, cancel))
    }

    fn open_session<'a>(
        &'a self,
        target: &'a Target,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, SessionEnd, BackendError> {
        Box::pin(async move {
            let args = self.session_args(target, &[]);
            let exit = self.runner.run_attached(&self.bin, &args, cancel).await?;
            Ok(session_end(exit))
        })
    }

    fn forward_port<'a>(
        &'a self,
        target: &'a Target,
        ports: PortPair,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, SessionEnd, BackendError> {
        Box::pin(async move {
            let parameters = json!({
                "portNumber": [ports.remote.to_string()],
                "localPortNumber": [ports.local.to_string()],
            });
            let extra = [
                String::from("--document-name"),
                String::from("AWS-StartPortForwardingSession"),
                String::from("--parameters"),
                parameters.to_string(),
            ];
            let args = self.session_args(target, &extra);
            let exit = self.runner.run_attached(&self.bin, &args, cancel).await?;
            Ok(session_end(exit))
        })
    }

    fn payload_limit(&self) -> u64 {
        DIRECT_PAYLOAD_LIMIT
    }

    fn stat_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
    ) -> BackendFuture<'a, RemoteFile, BackendError> {
        Box::pin(async move {
            let script = stat_script(target.platform, path);
            self.run_reporting_script(target, "stat", path, script)
                .await
        })
    }

    fn write_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
        bytes: &'a [u8],
    ) -> BackendFuture<'a, RemoteFile, BackendError> {
        Box::pin(async move {
            let script = write_script(target.platform, path, &STANDARD.encode(bytes));
            self.run_reporting_script(target, "write", path, script)
                .await
        })
    }

    fn read_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
    ) -> BackendFuture<'a, Vec<u8>, BackendError> {
        Box::pin(async move {
            let script = read_script(target.platform, path);
            let stdout = self.run_script(target, "read", path, script).await?;
            STANDARD
                .decode(stdout.trim())
                .map_err(|err| BackendError::Parse {
                    resource: String::from("read output"),
                    message: err.to_string(),
                })
        })
    }

    fn pull_from_relay<'a>(
        &'a self,
        target: &'a Target,
        location: &'a RelayLocation,
        path: &'a str,
    ) -> BackendFuture<'a, RemoteFile, BackendError> {
        Box::pin(async move {
            let script = pull_script(target.platform, location, path, &target.region);
            self.run_reporting_script(target, "relay pull", path, script)
                .await
        })
    }

    fn push_to_relay<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let script = push_script(target.platform, path, location, &target.region);
            self.run_script(target, "relay push", path, script)
                .await
                .map(|_stdout| ())
        })
    }
}
