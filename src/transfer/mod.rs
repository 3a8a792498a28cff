//! File transfers to and from targets.
//!
//! Payloads below the effective threshold travel inside the agent protocol.
//! Larger payloads go through a relay object that only the target can reach,
//! by way of a grant scoped to exactly that object. Every relay artifact is
//! recorded in the [`Registry`] before it is created and removed from it only
//! after the artifact is gone, so a crash at any point leaves a record that
//! [`crate::cleanup::Janitor`] can act on.
//!
//! Teardown runs after success, failure and cancellation alike. Its failures
//! are logged and reported alongside the outcome; they never turn a verified
//! transfer into a failed one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use chrono::Utc;
use serde::Serialize;
use tempfile::{NamedTempFile, TempPath};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{
    AgentChannel, BackendError, GrantAccess, GrantStore, RelayLocation, RelayStore,
    TemporaryGrant,
};
use crate::config::Policy;
use crate::error::OpsError;
use crate::operation::OperationId;
use crate::registry::{Registry, RegistryEntry, ResourceKind, entry_id};
use crate::retry::{RetryBudget, with_retries};
use crate::target::Target;

mod digest;
mod plan;

pub use digest::{Fingerprint, fingerprint_file, sha256_hex};
pub use plan::{Direction, Strategy, TransferPlan, choose_strategy};

/// Upper bound on a single teardown call.
const TEARDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Registry key of the lock marker recorded for a relayed transfer.
#[must_use]
pub fn lock_key(operation_id: OperationId) -> String {
    format!("transfer/{operation_id}")
}

/// Outcome of a verified transfer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TransferReport {
    /// Operation that performed the transfer.
    pub operation_id: OperationId,
    /// The plan that was executed.
    pub plan: TransferPlan,
    /// Verified SHA-256 of the payload.
    pub sha256: String,
    /// Teardown steps that failed; their registry entries remain for
    /// cleanup.
    pub teardown_failures: Vec<String>,
}

/// Relay artifacts belonging to one transfer.
#[derive(Clone, Debug)]
struct RelayScope {
    operation_id: OperationId,
    region: String,
    location: RelayLocation,
    grant: TemporaryGrant,
}

impl RelayScope {
    fn entries(&self) -> [RegistryEntry; 3] {
        let op = self.operation_id;
        [
            RegistryEntry::new(ResourceKind::LockMarker, lock_key(op), &self.region, op)
                .with_subject(&self.grant.target_id),
            RegistryEntry::new(
                ResourceKind::RelayObject,
                &self.location.key,
                &self.region,
                op,
            )
            .with_bucket(&self.location.bucket),
            RegistryEntry::new(ResourceKind::Grant, &self.grant.grant_id, &self.region, op)
                .with_subject(&self.grant.target_id),
        ]
    }
}

/// Moves files between the operator and targets.
#[derive(Clone)]
pub struct TransferEngine {
    agent: Arc<dyn AgentChannel>,
    relay: Arc<dyn RelayStore>,
    grants: Arc<dyn GrantStore>,
    registry: Arc<dyn Registry>,
    policy: Policy,
}

impl TransferEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        agent: Arc<dyn AgentChannel>,
        relay: Arc<dyn RelayStore>,
        grants: Arc<dyn GrantStore>,
        registry: Arc<dyn Registry>,
        policy: Policy,
    ) -> Self {
        Self {
            agent,
            relay,
            grants,
            registry,
            policy,
        }
    }

    /// Size at which transfers switch to the relay: the policy threshold,
    /// lowered to the agent's own payload limit when that is smaller.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.policy
            .direct_threshold_bytes
            .min(self.agent.payload_limit())
    }

    /// Copies `local` to `remote` on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::Integrity`] when the written bytes do not match,
    /// [`OpsError::Provision`] when a relay artifact cannot be created,
    /// [`OpsError::Transfer`] when bytes cannot be moved, and
    /// [`OpsError::Cancelled`] on cancellation.
    pub async fn upload(
        &self,
        operation_id: OperationId,
        target: &Target,
        local: &Utf8Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, OpsError> {
        let source = fingerprint_file(local)
            .await
            .map_err(|err| OpsError::Transfer {
                message: format!("cannot read {local}: {err}"),
            })?;
        let plan = TransferPlan::new(
            local.as_str(),
            remote,
            Direction::Upload,
            source.size,
            self.threshold(),
        );
        info!(%operation_id, target = %target, size = plan.size(), strategy = ?plan.strategy(), "uploading");

        match plan.strategy() {
            Strategy::Direct => {
                until_cancelled(cancel, self.upload_direct(target, local, remote, &source, cancel))
                    .await?;
                Ok(TransferReport {
                    operation_id,
                    plan,
                    sha256: source.sha256,
                    teardown_failures: Vec::new(),
                })
            }
            Strategy::Relayed => {
                let scope = self.scope(operation_id, target, local.file_name(), GrantAccess::Read)?;
                let moved = until_cancelled(
                    cancel,
                    self.upload_relayed(&scope, target, local, remote, &source, cancel),
                )
                .await;
                let teardown_failures = self.teardown(&scope).await;
                moved?;
                Ok(TransferReport {
                    operation_id,
                    plan,
                    sha256: source.sha256,
                    teardown_failures,
                })
            }
        }
    }

    /// Copies `remote` on `target` to `local`.
    ///
    /// # Errors
    ///
    /// As for [`TransferEngine::upload`].
    pub async fn download(
        &self,
        operation_id: OperationId,
        target: &Target,
        remote: &str,
        local: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, OpsError> {
        let region = target.region.as_str();
        let stat = until_cancelled(
            cancel,
            async {
                self.retrying("stat_file", cancel, || self.agent.stat_file(target, remote))
                    .await
                    .map_err(transfer_error(region))
            },
        )
        .await?;
        let plan = TransferPlan::new(
            remote,
            local.as_str(),
            Direction::Download,
            stat.size,
            self.threshold(),
        );
        info!(%operation_id, target = %target, size = plan.size(), strategy = ?plan.strategy(), "downloading");

        let expected = stat.digest.as_deref();
        match plan.strategy() {
            Strategy::Direct => {
                let received = until_cancelled(
                    cancel,
                    self.download_direct(target, remote, local, stat.size, expected, cancel),
                )
                .await?;
                Ok(TransferReport {
                    operation_id,
                    plan,
                    sha256: received.sha256,
                    teardown_failures: Vec::new(),
                })
            }
            Strategy::Relayed => {
                let scope =
                    self.scope(operation_id, target, remote_file_name(remote), GrantAccess::Write)?;
                let moved = until_cancelled(
                    cancel,
                    self.download_relayed(&scope, target, remote, local, stat.size, expected, cancel),
                )
                .await;
                let teardown_failures = self.teardown(&scope).await;
                let received = moved?;
                Ok(TransferReport {
                    operation_id,
                    plan,
                    sha256: received.sha256,
                    teardown_failures,
                })
            }
        }
    }

    async fn upload_direct(
        &self,
        target: &Target,
        local: &Utf8Path,
        remote: &str,
        source: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<(), OpsError> {
        let region = target.region.as_str();
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|err| OpsError::Transfer {
                message: format!("cannot read {local}: {err}"),
            })?;
        let written = self
            .retrying("write_file", cancel, || {
                self.agent.write_file(target, remote, &bytes)
            })
            .await
            .map_err(transfer_error(region))?;
        verify(
            remote,
            source.size,
            Some(&source.sha256),
            written.size,
            written.digest.as_deref(),
        )
    }

    async fn download_direct(
        &self,
        target: &Target,
        remote: &str,
        local: &Utf8Path,
        expected_size: u64,
        expected_digest: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Fingerprint, OpsError> {
        let region = target.region.as_str();
        let bytes = self
            .retrying("read_file", cancel, || self.agent.read_file(target, remote))
            .await
            .map_err(transfer_error(region))?;
        let received = Fingerprint {
            size: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };
        verify(
            local.as_str(),
            expected_size,
            expected_digest,
            received.size,
            Some(&received.sha256),
        )?;
        tokio::fs::write(local, &bytes)
            .await
            .map_err(|err| OpsError::Transfer {
                message: format!("cannot write {local}: {err}"),
            })?;
        Ok(received)
    }

    async fn upload_relayed(
        &self,
        scope: &RelayScope,
        target: &Target,
        local: &Utf8Path,
        remote: &str,
        source: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<(), OpsError> {
        let region = scope.region.as_str();
        self.register(scope)?;
        self.retrying("relay put", cancel, || {
            self.relay.put(region, local, &scope.location)
        })
        .await
        .map_err(provision_error("relay object", region))?;
        self.retrying("grant create", cancel, || self.grants.create(&scope.grant))
            .await
            .map_err(provision_error("grant", region))?;
        let pulled = self
            .retrying("pull from relay", cancel, || {
                self.agent.pull_from_relay(target, &scope.location, remote)
            })
            .await
            .map_err(transfer_error(region))?;
        verify(
            remote,
            source.size,
            Some(&source.sha256),
            pulled.size,
            pulled.digest.as_deref(),
        )
    }

    #[expect(
        clippy::too_many_arguments,
        reason = "mirrors download_direct plus the relay scope"
    )]
    async fn download_relayed(
        &self,
        scope: &RelayScope,
        target: &Target,
        remote: &str,
        local: &Utf8Path,
        expected_size: u64,
        expected_digest: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Fingerprint, OpsError> {
        let region = scope.region.as_str();
        self.register(scope)?;
        self.retrying("grant create", cancel, || self.grants.create(&scope.grant))
            .await
            .map_err(provision_error("grant", region))?;
        self.retrying("push to relay", cancel, || {
            self.agent.push_to_relay(target, remote, &scope.location)
        })
        .await
        .map_err(transfer_error(region))?;
        let staging = staging_path(local)?;
        let staged = Utf8Path::from_path(&staging).ok_or_else(|| OpsError::Transfer {
            message: format!("staging path for {local} is not UTF-8"),
        })?;
        self.retrying("relay get", cancel, || {
            self.relay.get(region, &scope.location, staged)
        })
        .await
        .map_err(transfer_error(region))?;
        let received = fingerprint_file(staged)
            .await
            .map_err(|err| OpsError::Transfer {
                message: format!("cannot read {staged}: {err}"),
            })?;
        verify(
            local.as_str(),
            expected_size,
            expected_digest,
            received.size,
            Some(&received.sha256),
        )?;
        staging.persist(local).map_err(|err| OpsError::Transfer {
            message: format!("cannot move download into {local}: {}", err.error),
        })?;
        Ok(received)
    }

    fn scope(
        &self,
        operation_id: OperationId,
        target: &Target,
        file_name: Option<&str>,
        access: GrantAccess,
    ) -> Result<RelayScope, OpsError> {
        let key = format!(
            "{}/{}/{}",
            self.policy.relay_prefix,
            operation_id.simple(),
            file_name.filter(|name| !name.is_empty()).unwrap_or("payload")
        );
        let location = self
            .relay
            .location(&key)
            .map_err(provision_error("relay object", &target.region))?;
        let grant = TemporaryGrant {
            grant_id: format!("{}{}", self.policy.grant_prefix, operation_id.simple()),
            target_id: target.id.clone(),
            region: target.region.clone(),
            scope: location.clone(),
            access,
            created_at: Utc::now(),
            operation_id,
        };
        Ok(RelayScope {
            operation_id,
            region: target.region.clone(),
            location,
            grant,
        })
    }

    fn register(&self, scope: &RelayScope) -> Result<(), OpsError> {
        for entry in scope.entries() {
            self.registry.register(entry)?;
        }
        Ok(())
    }

    /// Deletes the relay object, revokes the grant, then drops the registry
    /// entries of whatever is confirmed gone. The lock marker goes last and
    /// only when nothing else is left.
    async fn teardown(&self, scope: &RelayScope) -> Vec<String> {
        let region = scope.region.as_str();
        let mut failures = Vec::new();

        let relay_gone = self
            .teardown_step("relay object", &mut failures, || {
                self.relay.delete(region, &scope.location)
            })
            .await;
        let grant_gone = self
            .teardown_step("grant", &mut failures, || {
                self.grants
                    .revoke(region, &scope.grant.target_id, &scope.grant.grant_id)
            })
            .await;

        let mut released = Vec::new();
        if relay_gone {
            released.push(entry_id(ResourceKind::RelayObject, &scope.location.key));
        }
        if grant_gone {
            released.push(entry_id(ResourceKind::Grant, &scope.grant.grant_id));
        }
        if relay_gone && grant_gone {
            released.push(entry_id(ResourceKind::LockMarker, &lock_key(scope.operation_id)));
        }
        for id in released {
            if let Err(err) = self.registry.deregister(&id) {
                warn!(operation_id = %scope.operation_id, key = %id, error = %err, "failed to deregister");
                failures.push(err.to_string());
            }
        }
        failures
    }

    async fn teardown_step<F, Fut>(
        &self,
        resource: &str,
        failures: &mut Vec<String>,
        call: F,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), BackendError>>,
    {
        // Teardown must not inherit the caller's cancellation.
        let detached = CancellationToken::new();
        let budget = RetryBudget::from_policy(&self.policy);
        let outcome = tokio::time::timeout(
            TEARDOWN_STEP_TIMEOUT,
            with_retries(budget, resource, &detached, call),
        )
        .await;
        let message = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => err.to_string(),
            Err(_elapsed) => format!("no answer after {}s", TEARDOWN_STEP_TIMEOUT.as_secs()),
        };
        let err = OpsError::Teardown {
            resource: resource.to_owned(),
            message,
        };
        warn!(error = %err, "teardown left an artifact for cleanup");
        failures.push(err.to_string());
        false
    }

    async fn retrying<T, F, Fut>(
        &self,
        activity: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        with_retries(RetryBudget::from_policy(&self.policy), activity, cancel, call).await
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, OpsError>>,
) -> Result<T, OpsError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(OpsError::Cancelled),
        outcome = work => outcome,
    }
}

/// Temporary file next to `local`, removed on drop unless persisted.
fn staging_path(local: &Utf8Path) -> Result<TempPath, OpsError> {
    let dir = match local.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(".gangway-download-")
        .tempfile_in(dir)
        .map(NamedTempFile::into_temp_path)
        .map_err(|err| OpsError::Transfer {
            message: format!("cannot stage download in {dir}: {err}"),
        })
}

fn verify(
    path: &str,
    expected_size: u64,
    expected_digest: Option<&str>,
    actual_size: u64,
    actual_digest: Option<&str>,
) -> Result<(), OpsError> {
    let digest_mismatch = matches!(
        (expected_digest, actual_digest),
        (Some(want), Some(got)) if !want.eq_ignore_ascii_case(got)
    );
    if expected_size == actual_size && !digest_mismatch {
        return Ok(());
    }
    Err(OpsError::Integrity {
        path: path.to_owned(),
        expected_size,
        actual_size,
        expected_digest: expected_digest.map(str::to_owned),
        actual_digest: actual_digest.map(str::to_owned),
    })
}

fn remote_file_name(remote: &str) -> Option<&str> {
    remote.rsplit(['/', '\\']).next()
}

fn transfer_error(region: &str) -> impl FnOnce(BackendError) -> OpsError + '_ {
    move |err| {
        OpsError::from_backend(err, region, |other| OpsError::Transfer {
            message: other.to_string(),
        })
    }
}

fn provision_error<'a>(
    resource: &'static str,
    region: &'a str,
) -> impl FnOnce(BackendError) -> OpsError + 'a {
    move |err| {
        OpsError::from_backend(err, region, |other| OpsError::Provision {
            resource: resource.to_owned(),
            message: other.to_string(),
        })
    }
}
