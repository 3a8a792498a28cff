//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedRunner`] drives the AWS CLI backends with canned process output.
//! [`FakeCloud`] implements every collaborator trait in memory, with switches
//! for the failures the orchestrator must survive.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::backend::{
    AgentChannel, BackendError, BackendFuture, CommandInvocation, CommandStatus, CredentialCheck,
    GrantAccess, GrantStore, Inventory, LiveGrant, PortPair, PowerAction, PowerControl,
    RelayLocation, RelayStore, RemoteCommand, RemoteFile, SessionEnd, TemporaryGrant,
};
use crate::command::{AttachedExit, CommandOutput, CommandRunner, RunnerError};
use crate::target::{AgentState, Platform, TagFilter, Target};
use crate::transfer::sha256_hex;

/// Region used by [`target`] and the fake relay.
pub const FAKE_REGION: &str = "ca-central-1";

/// Bucket reported by [`FakeCloud`]'s relay.
pub const FAKE_BUCKET: &str = "gangway-test-relay";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<RecordedInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl RecordedInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with `stdout`.
    pub fn push_json(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn next(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        lock(&self.invocations).push(RecordedInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> BackendFuture<'a, CommandOutput, RunnerError> {
        Box::pin(async move { self.next(program, args) })
    }

    fn run_attached<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, AttachedExit, RunnerError> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Ok(AttachedExit::Cancelled);
            }
            self.next(program, args)
                .map(|output| AttachedExit::Exited(output.code))
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets (`Some`) or removes (`None`) variables while holding a global
    /// mutex.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Builds an online Linux target in [`FAKE_REGION`].
#[must_use]
pub fn target(id: &str, name: &str) -> Target {
    let mut tags = BTreeMap::new();
    tags.insert(String::from("Name"), name.to_owned());
    Target {
        id: id.to_owned(),
        name: name.to_owned(),
        region: FAKE_REGION.to_owned(),
        platform: Platform::Linux,
        agent: AgentState::Online,
        tags,
    }
}

/// Scripted behaviour of a command on one fake target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FakeCommand {
    /// The command exits with `code`.
    Exit {
        /// Exit code.
        code: i32,
        /// Standard output.
        stdout: String,
    },
    /// The command never finishes.
    Hang,
    /// The next `remaining` deliveries fail transiently, then it exits 0.
    FlakyDelivery {
        /// Transient failures still to report.
        remaining: u32,
    },
}

/// Failure switches for [`FakeCloud`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Faults {
    /// Credential checks fail with this message.
    pub invalid_credentials: Option<String>,
    /// Grant revocation fails.
    pub fail_revoke: bool,
    /// Relay deletion fails.
    pub fail_relay_delete: bool,
    /// Grant creation fails.
    pub fail_grant_create: bool,
    /// The agent pull never completes.
    pub hang_on_pull: bool,
    /// The agent drops the final byte while writing files.
    pub truncate_writes: bool,
    /// Relay downloads flip the first byte of the object.
    pub corrupt_relay_reads: bool,
    /// Interactive sessions and tunnels drop on their own.
    pub drop_sessions: bool,
    /// Power transitions fail for these instance ids.
    pub power_failures: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    targets: Vec<Target>,
    commands: BTreeMap<String, FakeCommand>,
    relay: BTreeMap<String, Vec<u8>>,
    grants: BTreeMap<String, TemporaryGrant>,
    files: BTreeMap<(String, String), Vec<u8>>,
    power: Vec<(String, PowerAction)>,
    calls: Vec<String>,
    faults: Faults,
}

/// In-memory cloud implementing every collaborator trait.
#[derive(Debug)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
    payload_limit: u64,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            payload_limit: u64::MAX,
        }
    }
}

impl FakeCloud {
    /// Creates a cloud holding `targets`.
    #[must_use]
    pub fn with_targets(targets: Vec<Target>) -> Self {
        let cloud = Self::default();
        lock(&cloud.state).targets = targets;
        cloud
    }

    /// Caps the direct channel's payload size.
    #[must_use]
    pub fn with_payload_limit(mut self, limit: u64) -> Self {
        self.payload_limit = limit;
        self
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        lock(&self.state)
    }

    /// Applies `update` to the failure switches.
    pub fn set_faults(&self, update: impl FnOnce(&mut Faults)) {
        update(&mut self.state().faults);
    }

    /// Scripts how commands behave on `target_id`.
    pub fn script_command(&self, target_id: &str, behaviour: FakeCommand) {
        self.state()
            .commands
            .insert(target_id.to_owned(), behaviour);
    }

    /// Seeds a file on a target.
    pub fn put_remote_file(&self, target_id: &str, path: &str, bytes: Vec<u8>) {
        self.state()
            .files
            .insert((target_id.to_owned(), path.to_owned()), bytes);
    }

    /// Reads a file from a target.
    #[must_use]
    pub fn remote_file(&self, target_id: &str, path: &str) -> Option<Vec<u8>> {
        self.state()
            .files
            .get(&(target_id.to_owned(), path.to_owned()))
            .cloned()
    }

    /// Seeds a live grant, bypassing the orchestrator.
    pub fn insert_grant(&self, grant: TemporaryGrant) {
        self.state().grants.insert(grant.grant_id.clone(), grant);
    }

    /// Seeds a relay object, bypassing the orchestrator.
    pub fn insert_relay_object(&self, location: &RelayLocation, bytes: Vec<u8>) {
        self.state().relay.insert(location.uri(), bytes);
    }

    /// Ids of grants currently attached to identities.
    #[must_use]
    pub fn live_grant_ids(&self) -> Vec<String> {
        self.state().grants.keys().cloned().collect()
    }

    /// URIs of relay objects currently stored.
    #[must_use]
    pub fn relay_uris(&self) -> Vec<String> {
        self.state().relay.keys().cloned().collect()
    }

    /// Power transitions applied so far.
    #[must_use]
    pub fn power_log(&self) -> Vec<(String, PowerAction)> {
        self.state().power.clone()
    }

    /// Names of collaborator calls made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, call: &str) {
        self.state().calls.push(call.to_owned());
    }

    fn require_grant(
        &self,
        target: &Target,
        location: &RelayLocation,
        access: GrantAccess,
    ) -> Result<(), BackendError> {
        let state = self.state();
        let granted = state.grants.values().any(|grant| {
            grant.target_id == target.id && grant.scope == *location && grant.access == access
        });
        if granted {
            Ok(())
        } else {
            Err(BackendError::CommandFailure {
                program: String::from("agent"),
                status: Some(1),
                status_text: String::from("1"),
                stderr: format!("AccessDenied: {} may not reach {location}", target.id),
            })
        }
    }

    fn store_remote(&self, target: &Target, path: &str, bytes: &[u8]) -> RemoteFile {
        let mut state = self.state();
        let stored = if state.faults.truncate_writes {
            bytes
                .split_last()
                .map_or_else(Vec::new, |(_, rest)| rest.to_vec())
        } else {
            bytes.to_vec()
        };
        let file = RemoteFile {
            size: stored.len() as u64,
            digest: Some(sha256_hex(&stored)),
        };
        state
            .files
            .insert((target.id.clone(), path.to_owned()), stored);
        file
    }

    fn read_remote(&self, target: &Target, path: &str) -> Result<Vec<u8>, BackendError> {
        self.state()
            .files
            .get(&(target.id.clone(), path.to_owned()))
            .cloned()
            .ok_or_else(|| BackendError::not_found("remote file", path))
    }
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> BackendError {
    BackendError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

impl CredentialCheck for FakeCloud {
    fn verify<'a>(&'a self, _region: &'a str) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.record("auth.verify");
            match self.state().faults.invalid_credentials.clone() {
                Some(message) => Err(BackendError::Credential { message }),
                None => Ok(()),
            }
        })
    }
}

impl Inventory for FakeCloud {
    fn describe<'a>(
        &'a self,
        region: &'a str,
        id: &'a str,
    ) -> BackendFuture<'a, Option<Target>, BackendError> {
        Box::pin(async move {
            self.record("inventory.describe");
            Ok(self
                .state()
                .targets
                .iter()
                .find(|target| target.id == id && target.region == region)
                .cloned())
        })
    }

    fn list<'a>(
        &'a self,
        region: &'a str,
        filter: Option<&'a TagFilter>,
    ) -> BackendFuture<'a, Vec<Target>, BackendError> {
        Box::pin(async move {
            self.record("inventory.list");
            Ok(self
                .state()
                .targets
                .iter()
                .filter(|target| target.region == region)
                .filter(|target| filter.is_none_or(|tags| target.matches(tags)))
                .cloned()
                .collect())
        })
    }
}

impl PowerControl for FakeCloud {
    fn set_power<'a>(
        &'a self,
        target: &'a Target,
        action: PowerAction,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let mut state = self.state();
            if state.faults.power_failures.contains(&target.id) {
                return Err(BackendError::CommandFailure {
                    program: String::from("ec2"),
                    status: Some(255),
                    status_text: String::from("255"),
                    stderr: format!("IncorrectInstanceState: cannot {action} {}", target.id),
                });
            }
            state.power.push((target.id.clone(), action));
            Ok(())
        })
    }
}

impl AgentChannel for FakeCloud {
    fn run_command<'a>(
        &'a self,
        target: &'a Target,
        command: &'a RemoteCommand,
        _cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, CommandInvocation, BackendError> {
        Box::pin(async move {
            let behaviour = {
                let mut state = self.state();
                state.calls.push(format!("agent.run_command:{}", target.id));
                let entry = state.commands.get_mut(&target.id);
                match entry {
                    Some(FakeCommand::FlakyDelivery { remaining }) if *remaining > 0 => {
                        *remaining -= 1;
                        return Err(BackendError::Transient {
                            message: String::from("ThrottlingException"),
                        });
                    }
                    Some(behaviour) => behaviour.clone(),
                    None => FakeCommand::Exit {
                        code: 0,
                        stdout: command.script.clone(),
                    },
                }
            };
            match behaviour {
                FakeCommand::Exit { code, stdout } => Ok(CommandInvocation {
                    exit_code: Some(code),
                    stdout,
                    stderr: String::new(),
                    status: if code == 0 {
                        CommandStatus::Success
                    } else {
                        CommandStatus::Failed
                    },
                }),
                FakeCommand::Hang => std::future::pending().await,
                FakeCommand::FlakyDelivery { .. } => Ok(CommandInvocation {
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                    status: CommandStatus::Success,
                }),
            }
        })
    }

    fn open_session<'a>(
        &'a self,
        target: &'a Target,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, SessionEnd, BackendError> {
        Box::pin(async move {
            self.record(&format!("agent.open_session:{}", target.id));
            if self.state().faults.drop_sessions {
                return Ok(SessionEnd::Terminated(Some(255)));
            }
            cancel.cancelled().await;
            Ok(SessionEnd::Cancelled)
        })
    }

    fn forward_port<'a>(
        &'a self,
        target: &'a Target,
        ports: PortPair,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, SessionEnd, BackendError> {
        Box::pin(async move {
            self.record(&format!(
                "agent.forward_port:{}:{}:{}",
                target.id, ports.local, ports.remote
            ));
            if self.state().faults.drop_sessions {
                return Ok(SessionEnd::Terminated(None));
            }
            cancel.cancelled().await;
            Ok(SessionEnd::Cancelled)
        })
    }

    fn payload_limit(&self) -> u64 {
        self.payload_limit
    }

    fn stat_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
    ) -> BackendFuture<'a, RemoteFile, BackendError> {
        Box::pin(async move {
            self.record("agent.stat_file");
            let bytes = self.read_remote(target, path)?;
            Ok(RemoteFile {
                size: bytes.len() as u64,
                digest: Some(sha256_hex(&bytes)),
            })
        })
    }

    fn write_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
        bytes: &'a [u8],
    ) -> BackendFuture<'a, RemoteFile, BackendError> {
        Box::pin(async move {
            self.record("agent.write_file");
            Ok(self.store_remote(target, path, bytes))
        })
    }

    fn read_file<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
    ) -> BackendFuture<'a, Vec<u8>, BackendError> {
        Box::pin(async move {
            self.record("agent.read_file");
            self.read_remote(target, path)
        })
    }

    fn pull_from_relay<'a>(
        &'a self,
        target: &'a Target,
        location: &'a RelayLocation,
        path: &'a str,
    ) -> BackendFuture<'a, RemoteFile, BackendError> {
        Box::pin(async move {
            self.record("agent.pull_from_relay");
            if self.state().faults.hang_on_pull {
                return std::future::pending().await;
            }
            self.require_grant(target, location, GrantAccess::Read)?;
            let bytes = self
                .state()
                .relay
                .get(&location.uri())
                .cloned()
                .ok_or_else(|| BackendError::not_found("relay object", &location.uri()))?;
            Ok(self.store_remote(target, path, &bytes))
        })
    }

    fn push_to_relay<'a>(
        &'a self,
        target: &'a Target,
        path: &'a str,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.record("agent.push_to_relay");
            self.require_grant(target, location, GrantAccess::Write)?;
            let bytes = self.read_remote(target, path)?;
            self.state().relay.insert(location.uri(), bytes);
            Ok(())
        })
    }
}

impl RelayStore for FakeCloud {
    fn location(&self, key: &str) -> Result<RelayLocation, BackendError> {
        Ok(RelayLocation {
            bucket: FAKE_BUCKET.to_owned(),
            key: key.to_owned(),
        })
    }

    fn put<'a>(
        &'a self,
        _region: &'a str,
        local: &'a Utf8Path,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.record("relay.put");
            let bytes = tokio::fs::read(local)
                .await
                .map_err(|err| io_error(local, &err))?;
            self.state().relay.insert(location.uri(), bytes);
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        _region: &'a str,
        location: &'a RelayLocation,
        local: &'a Utf8Path,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.record("relay.get");
            let bytes = {
                let state = self.state();
                let mut stored = state
                    .relay
                    .get(&location.uri())
                    .cloned()
                    .ok_or_else(|| BackendError::not_found("relay object", &location.uri()))?;
                if state.faults.corrupt_relay_reads
                    && let Some(first) = stored.first_mut()
                {
                    *first = !*first;
                }
                stored
            };
            tokio::fs::write(local, bytes)
                .await
                .map_err(|err| io_error(local, &err))
        })
    }

    fn delete<'a>(
        &'a self,
        _region: &'a str,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.record("relay.delete");
            let mut state = self.state();
            if state.faults.fail_relay_delete {
                return Err(BackendError::Transient {
                    message: String::from("SlowDown"),
                });
            }
            state.relay.remove(&location.uri());
            Ok(())
        })
    }
}

impl GrantStore for FakeCloud {
    fn create<'a>(&'a self, grant: &'a TemporaryGrant) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.record("grant.create");
            let mut state = self.state();
            if state.faults.fail_grant_create {
                return Err(BackendError::CommandFailure {
                    program: String::from("iam"),
                    status: Some(254),
                    status_text: String::from("254"),
                    stderr: String::from("LimitExceeded"),
                });
            }
            state.grants.insert(grant.grant_id.clone(), grant.clone());
            Ok(())
        })
    }

    fn revoke<'a>(
        &'a self,
        _region: &'a str,
        _target_id: &'a str,
        grant_id: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.record("grant.revoke");
            let mut state = self.state();
            if state.faults.fail_revoke {
                return Err(BackendError::Transient {
                    message: String::from("ServiceUnavailable"),
                });
            }
            state.grants.remove(grant_id);
            Ok(())
        })
    }

    fn list_live<'a>(
        &'a self,
        region: &'a str,
        prefix: &'a str,
    ) -> BackendFuture<'a, Vec<LiveGrant>, BackendError> {
        Box::pin(async move {
            self.record("grant.list_live");
            Ok(self
                .state()
                .grants
                .values()
                .filter(|grant| grant.region == region && grant.grant_id.starts_with(prefix))
                .map(|grant| LiveGrant {
                    grant_id: grant.grant_id.clone(),
                    target_id: grant.target_id.clone(),
                })
                .collect())
        })
    }
}
