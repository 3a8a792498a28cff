//! Collaborator seams driven by the orchestrator.
//!
//! The orchestrator never talks to the cloud directly. It drives the traits in
//! this module, which the [`crate::aws`] module implements on top of the `aws`
//! CLI and [`crate::test_support::FakeCloud`] implements in memory.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::command::RunnerError;
use crate::operation::OperationId;
use crate::target::{TagFilter, Target};

/// Future returned by collaborator operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Errors raised by collaborators.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// The referenced resource does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Resource type, for example `instance` or `relay object`.
        resource: String,
        /// Identifier that was looked up.
        id: String,
    },
    /// Credentials were rejected or have expired.
    #[error("credentials rejected: {message}")]
    Credential {
        /// Provider message.
        message: String,
    },
    /// Throttling, service unavailability, or a dropped connection.
    #[error("transient control-plane error: {message}")]
    Transient {
        /// Provider message.
        message: String,
    },
    /// A provider CLI returned a non-zero exit status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Provider output could not be parsed.
    #[error("failed to parse {resource} output: {message}")]
    Parse {
        /// Resource being parsed.
        resource: String,
        /// Parser error message.
        message: String,
    },
    /// The collaborator is missing configuration it needs.
    #[error("backend misconfigured: {message}")]
    Config {
        /// What is missing.
        message: String,
    },
    /// Local I/O performed on behalf of the collaborator failed.
    #[error("local I/O failed for {path}: {message}")]
    Io {
        /// Path being accessed.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// The call was abandoned because the caller cancelled.
    #[error("cancelled")]
    Cancelled,
    /// Process execution failed.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl BackendError {
    /// Returns `true` for failures worth a bounded retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Convenience constructor for [`BackendError::NotFound`].
    #[must_use]
    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::NotFound {
            resource: resource.to_owned(),
            id: id.to_owned(),
        }
    }
}

/// A command to execute through the agent channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    /// Script text in the target platform's shell dialect.
    pub script: String,
    /// Optional working directory on the target.
    pub working_dir: Option<String>,
    /// Execution timeout enforced by the agent.
    pub timeout: Duration,
}

/// Terminal status of a command on one target.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// The command ran and exited zero.
    Success,
    /// The command ran and failed, or could not be delivered.
    Failed,
    /// The command did not finish in time.
    TimedOut,
}

/// What the agent reported for one command invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Exit code, when the command produced one.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Terminal status.
    pub status: CommandStatus,
}

/// How an interactive session or tunnel ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionEnd {
    /// The session closed cleanly.
    Closed,
    /// The agent side terminated the session with the given exit code.
    Terminated(Option<i32>),
    /// The caller cancelled.
    Cancelled,
}

/// Validated local and remote ports of a tunnel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortPair {
    /// Port bound on the operator's machine.
    pub local: u16,
    /// Port on the target.
    pub remote: u16,
}

/// Size and digest of a file on a target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFile {
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256, when the target can compute one.
    pub digest: Option<String>,
}

/// A single object in relay storage.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RelayLocation {
    /// Bucket holding relay objects.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl RelayLocation {
    /// `s3://bucket/key` form used by the storage CLIs.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Resource ARN used to scope grants to exactly this object.
    #[must_use]
    pub fn arn(&self) -> String {
        format!("arn:aws:s3:::{}/{}", self.bucket, self.key)
    }
}

impl fmt::Display for RelayLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Access a grant confers on its relay location.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantAccess {
    /// The target may read the object (uploads).
    Read,
    /// The target may write the object (downloads).
    Write,
}

/// Narrow, short-lived permission for one target to reach one relay object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemporaryGrant {
    /// Grant identifier, following the configured naming convention.
    pub grant_id: String,
    /// Instance the grant is attached to.
    pub target_id: String,
    /// Region of the target.
    pub region: String,
    /// The single relay object the grant covers.
    pub scope: RelayLocation,
    /// Read or write.
    pub access: GrantAccess,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Operation that created the grant.
    pub operation_id: OperationId,
}

/// A grant discovered on a live identity by naming convention.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LiveGrant {
    /// Grant identifier.
    pub grant_id: String,
    /// Instance whose identity carries the grant.
    pub target_id: String,
}

/// Power transitions available for fleet fan-out.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    /// Start a stopped instance.
    Start,
    /// Stop a running instance.
    Stop,
    /// Reboot a running instance.
    Reboot,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
        })
    }
}

/// Validates region-scoped credentials before an operation starts.
pub trait CredentialCheck: Send + Sync {
    /// Succeeds when the credential set for `region` is usable.
    fn verify<'a>(&'a self, region: &'a str) -> BackendFuture<'a, (), BackendError>;
}

/// Source of targets and their reachability.
pub trait Inventory: Send + Sync {
    /// Looks up a single instance by id; `None` when it does not exist.
    fn describe<'a>(
        &'a self,
        region: &'a str,
        id: &'a str,
    ) -> BackendFuture<'a, Option<Target>, BackendError>;

    /// Lists instances in `region`, narrowed by `filter` when supplied.
    fn list<'a>(
        &'a self,
        region: &'a str,
        filter: Option<&'a TagFilter>,
    ) -> BackendFuture<'a, Vec<Target>, BackendError>;
}

/// Control-plane power transitions.
pub trait PowerControl: Send + Sync {
    /// Applies `action` to the instance.
    fn set_power<'a>(
        &'a self,
        target: &'a Target,
        action: PowerAction,
    ) -> BackendFuture<'a, (), BackendError>;
}

/// The remote-management agent channel, driven as a black box.
pub trait AgentChannel: Send + Sync {
    /// Runs a command and waits for a terminal status.
    fn run_command<'a>(
        &'a self,
        target: &'a Target,
        command: &'a RemoteCommand,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, CommandInvocation, BackendError>;

    /// Opens an interactive session attached to the caller's terminal.
    fn open_session<'a>(
        &'a self,
        target: &'a Target,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, SessionEnd, BackendError>;

    /// Tunnels `ports.local` to `ports.remote` until cancelled or dropped.
    fn forward_port<'a>(
        &'a self,
        target: &'a Target,
        ports: PortPair,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, SessionEnd, BackendError>;

    /// Largest payload the direct channel carries in one message.
    fn payload_limit(&self) -> u64;

    /// Reports size and digest of a remote file.
    fn stat_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
    ) -> BackendFuture<'a, RemoteFile, BackendError>;

    /// Writes `bytes` to `path` through the direct channel.
    fn write_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
        bytes: &'a [u8],
    ) -> BackendFuture<'a, RemoteFile, BackendError>;

    /// Reads `path` through the direct channel.
    fn read_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
    ) -> BackendFuture<'a, Vec<u8>, BackendError>;

    /// Has the target copy a relay object to `path`.
    fn pull_from_relay<'a>(
        &'a self,
        target: &'a Target,
        location: &'a RelayLocation,
        path: &'a str,
    ) -> BackendFuture<'a, RemoteFile, BackendError>;

    /// Has the target copy `path` into a relay object.
    fn push_to_relay<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError>;
}

/// Object storage used to shuttle large payloads.
pub trait RelayStore: Send + Sync {
    /// Maps a relay key to its storage location.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] when no relay bucket is configured.
    fn location(&self, key: &str) -> Result<RelayLocation, BackendError>;

    /// Uploads a local file to the relay.
    fn put<'a>(
        &'a self,
        region: &'a str,
        local: &'a Utf8Path,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError>;

    /// Downloads a relay object to a local file.
    fn get<'a>(
        &'a self,
        region: &'a str,
        location: &'a RelayLocation,
        local: &'a Utf8Path,
    ) -> BackendFuture<'a, (), BackendError>;

    /// Deletes a relay object; deleting a missing object succeeds.
    fn delete<'a>(
        &'a self,
        region: &'a str,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError>;
}

/// Issues and revokes temporary grants.
pub trait GrantStore: Send + Sync {
    /// Attaches `grant` to the target's identity.
    fn create<'a>(&'a self, grant: &'a TemporaryGrant) -> BackendFuture<'a, (), BackendError>;

    /// Detaches a grant; revoking an unknown or revoked grant succeeds.
    fn revoke<'a>(
        &'a self,
        region: &'a str,
        target_id: &'a str,
        grant_id: &'a str,
    ) -> BackendFuture<'a, (), BackendError>;

    /// Lists grants whose identifier starts with `prefix` on live identities.
    fn list_live<'a>(
        &'a self,
        region: &'a str,
        prefix: &'a str,
    ) -> BackendFuture<'a, Vec<LiveGrant>, BackendError>;
}
