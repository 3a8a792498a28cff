//! The operation surface exposed to callers.
//!
//! [`Orchestrator`] wires the region and instance resolvers, the executor,
//! the transfer engine, the port forwarder and the janitor over one set of
//! collaborators. Every call mints an [`OperationId`], checks credentials
//! for the resolved region once (never retried), runs inside an
//! `operation` span, and reports fatal errors as [`OperationFailure`]
//! naming the operation and its target.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, info, info_span};

use crate::aws::AwsBackend;
use crate::backend::{
    AgentChannel, CredentialCheck, GrantStore, Inventory, PowerAction, PowerControl, RelayStore,
    SessionEnd,
};
use crate::cleanup::{CleanupSummary, Janitor};
use crate::config::{ConfigError, GangwayConfig, Policy};
use crate::error::{OperationFailure, OpsError};
use crate::exec::{CommandRequest, CommandResult, Executor};
use crate::forward::{PortForwarder, TunnelHandle, validate_ports};
use crate::operation::OperationId;
use crate::pool::FanOutReport;
use crate::power::{PowerManager, PowerResult};
use crate::region::RegionResolver;
use crate::registry::{FileRegistry, Registry};
use crate::resolver::{FuzzyPicker, InstanceResolver, Selection};
use crate::target::{TagFilter, Target};
use crate::transfer::{TransferEngine, TransferReport};

/// How the caller refers to the instances an operation acts on.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Selector {
    /// Instance id or name; empty defers to the picker or the filter.
    pub identifier: String,
    /// Region code, short or canonical; empty means the default region.
    pub region: String,
    /// Optional tag filter.
    pub filter: Option<TagFilter>,
}

impl Selector {
    /// Selects one instance by id or name.
    #[must_use]
    pub fn instance(identifier: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            region: region.into(),
            filter: None,
        }
    }

    /// Selects every instance matching `filter`.
    #[must_use]
    pub fn tagged(filter: TagFilter, region: impl Into<String>) -> Self {
        Self {
            identifier: String::new(),
            region: region.into(),
            filter: Some(filter),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.filter, self.identifier.trim()) {
            (Some(filter), "") => write!(f, "tag {filter}"),
            (_, "") => f.write_str("<interactive>"),
            (_, identifier) => f.write_str(identifier),
        }
    }
}

/// Everything the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Auth collaborator.
    pub credentials: Arc<dyn CredentialCheck>,
    /// Instance inventory.
    pub inventory: Arc<dyn Inventory>,
    /// Start, stop and reboot.
    pub power: Arc<dyn PowerControl>,
    /// Remote-management agent.
    pub agent: Arc<dyn AgentChannel>,
    /// Relay object storage.
    pub relay: Arc<dyn RelayStore>,
    /// Temporary grants.
    pub grants: Arc<dyn GrantStore>,
    /// Durable artifact registry.
    pub registry: Arc<dyn Registry>,
    /// Interactive fallback for ambiguous or missing identifiers.
    pub picker: Arc<dyn FuzzyPicker>,
}

impl Collaborators {
    /// Uses one provider implementation for every cloud-facing seam.
    #[must_use]
    pub fn from_cloud<C>(
        cloud: &Arc<C>,
        registry: Arc<dyn Registry>,
        picker: Arc<dyn FuzzyPicker>,
    ) -> Self
    where
        C: CredentialCheck + Inventory + PowerControl + AgentChannel + RelayStore + GrantStore,
        C: 'static,
    {
        Self {
            credentials: Arc::clone(cloud) as Arc<dyn CredentialCheck>,
            inventory: Arc::clone(cloud) as Arc<dyn Inventory>,
            power: Arc::clone(cloud) as Arc<dyn PowerControl>,
            agent: Arc::clone(cloud) as Arc<dyn AgentChannel>,
            relay: Arc::clone(cloud) as Arc<dyn RelayStore>,
            grants: Arc::clone(cloud) as Arc<dyn GrantStore>,
            registry,
            picker,
        }
    }
}

/// Remote operations and transfer orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    credentials: Arc<dyn CredentialCheck>,
    regions: RegionResolver,
    resolver: InstanceResolver,
    executor: Executor,
    power: PowerManager,
    forwarder: PortForwarder,
    transfers: TransferEngine,
    janitor: Janitor,
    cleanup_older_than: Duration,
}

impl Orchestrator {
    /// Builds every component over `collaborators` with `policy`.
    #[must_use]
    pub fn new(collaborators: Collaborators, policy: &Policy) -> Self {
        let Collaborators {
            credentials,
            inventory,
            power,
            agent,
            relay,
            grants,
            registry,
            picker,
        } = collaborators;
        Self {
            credentials,
            regions: RegionResolver::new(policy.default_region.clone()),
            resolver: InstanceResolver::new(inventory, picker),
            executor: Executor::new(Arc::clone(&agent), policy.clone()),
            power: PowerManager::new(power, policy.clone()),
            forwarder: PortForwarder::new(Arc::clone(&agent)),
            transfers: TransferEngine::new(
                agent,
                Arc::clone(&relay),
                Arc::clone(&grants),
                Arc::clone(&registry),
                policy.clone(),
            ),
            janitor: Janitor::new(relay, grants, registry, policy.clone()),
            cleanup_older_than: policy.cleanup_older_than,
        }
    }

    /// Wires the AWS CLI backends and the file registry from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration does not validate.
    pub fn from_config(
        config: &GangwayConfig,
        picker: Arc<dyn FuzzyPicker>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = config.policy()?;
        let backend = Arc::new(AwsBackend::from_config(config));
        let registry = Arc::new(FileRegistry::new(config.registry_path()));
        let collaborators = Collaborators::from_cloud(&backend, registry, picker);
        Ok(Self::new(collaborators, &policy))
    }

    /// Maps a region code to its canonical region. Never fails.
    #[must_use]
    pub fn resolve_region(&self, code: &str) -> String {
        self.regions.resolve(code)
    }

    /// Resolves `selector` to one target or a tag-filtered fleet.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] wrapping the resolver or credential
    /// error.
    pub async fn select(&self, selector: &Selector) -> Result<Selection, OperationFailure> {
        let (operation_id, region) = self.begin(selector);
        traced(operation_id, &region, "select", async {
            self.verify(&region)
                .await
                .map_err(|err| OperationFailure::new(operation_id, selector.to_string(), err))?;
            self.resolver
                .select(&selector.identifier, &region, selector.filter.as_ref())
                .await
                .map_err(|err| OperationFailure::new(operation_id, selector.to_string(), err))
        })
        .await
    }

    /// Opens an interactive session on the selected target and blocks until
    /// it ends.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] when the target cannot be resolved or the
    /// session fails, drops or is cancelled.
    pub async fn open_session(
        &self,
        selector: &Selector,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, OperationFailure> {
        let (operation_id, region) = self.begin(selector);
        traced(operation_id, &region, "session", async {
            let target = self.single(operation_id, selector, &region).await?;
            self.executor
                .open_session(&target, cancel)
                .await
                .map_err(|err| OperationFailure::new(operation_id, target.to_string(), err))
        })
        .await
    }

    /// Runs `request` on every selected target.
    ///
    /// The timeout is validated before any network call.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] wrapping [`OpsError::PartialFailure`] when
    /// some targets of a fan-out did not succeed, [`OpsError::Timeout`] when a
    /// single target timed out, or the validation, resolution or credential
    /// error.
    pub async fn run_commands(
        &self,
        selector: &Selector,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<FanOutReport<CommandResult>, OperationFailure> {
        let (operation_id, region) = self.begin(selector);
        traced(operation_id, &region, "run", async {
            self.executor
                .validate(request)
                .map_err(|err| OperationFailure::new(operation_id, selector.to_string(), err))?;
            let targets = self.fleet(operation_id, selector, &region).await?;
            self.executor
                .run(operation_id, targets, request, cancel)
                .await
                .map_err(|err| OperationFailure::new(operation_id, selector.to_string(), err))
        })
        .await
    }

    /// Starts, stops or reboots every selected target.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] wrapping
    /// [`OpsError::PowerPartialFailure`] when any target did not transition.
    pub async fn power(
        &self,
        selector: &Selector,
        action: PowerAction,
        cancel: &CancellationToken,
    ) -> Result<FanOutReport<PowerResult>, OperationFailure> {
        let (operation_id, region) = self.begin(selector);
        traced(operation_id, &region, "power", async {
            let targets = self.fleet(operation_id, selector, &region).await?;
            self.power
                .apply(operation_id, targets, action, cancel)
                .await
                .map_err(|err| OperationFailure::new(operation_id, selector.to_string(), err))
        })
        .await
    }

    /// Copies `local` to `remote` on the selected target.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] wrapping the transfer error; relay
    /// artifacts that could not be torn down stay registered for cleanup.
    pub async fn upload_file(
        &self,
        selector: &Selector,
        local: &Utf8Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, OperationFailure> {
        let (operation_id, region) = self.begin(selector);
        traced(operation_id, &region, "upload", async {
            let target = self.single(operation_id, selector, &region).await?;
            self.transfers
                .upload(operation_id, &target, local, remote, cancel)
                .await
                .map_err(|err| OperationFailure::new(operation_id, target.to_string(), err))
        })
        .await
    }

    /// Copies `remote` on the selected target to `local`.
    ///
    /// # Errors
    ///
    /// As for [`Orchestrator::upload_file`].
    pub async fn download_file(
        &self,
        selector: &Selector,
        remote: &str,
        local: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, OperationFailure> {
        let (operation_id, region) = self.begin(selector);
        traced(operation_id, &region, "download", async {
            let target = self.single(operation_id, selector, &region).await?;
            self.transfers
                .download(operation_id, &target, remote, local, cancel)
                .await
                .map_err(|err| OperationFailure::new(operation_id, target.to_string(), err))
        })
        .await
    }

    /// Opens a tunnel from `local_port` to `remote_port` on the selected
    /// target and returns its handle. The tunnel stops when `cancel` fires
    /// or the handle is dropped.
    ///
    /// Ports are validated before any network call.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] wrapping [`OpsError::InvalidPort`], or the
    /// resolution or credential error.
    pub async fn forward_port(
        &self,
        selector: &Selector,
        local_port: u32,
        remote_port: u32,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, OperationFailure> {
        let (operation_id, region) = self.begin(selector);
        traced(operation_id, &region, "forward", async {
            let ports = validate_ports(local_port, remote_port)
                .map_err(|err| OperationFailure::new(operation_id, selector.to_string(), err))?;
            let target = self.single(operation_id, selector, &region).await?;
            Ok(self.forwarder.spawn(target, ports, cancel))
        })
        .await
    }

    /// Reclaims registry entries in `region_code` at least `older_than` old,
    /// defaulting to the configured age.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] wrapping [`OpsError::CleanupIncomplete`]
    /// when any artifact remains.
    pub async fn cleanup(
        &self,
        region_code: &str,
        older_than: Option<Duration>,
    ) -> Result<CleanupSummary, OperationFailure> {
        let operation_id = OperationId::new();
        let region = self.regions.resolve(region_code);
        let age = older_than.unwrap_or(self.cleanup_older_than);
        traced(operation_id, &region, "cleanup", async {
            self.verify(&region)
                .await
                .map_err(|err| OperationFailure::new(operation_id, region.clone(), err))?;
            self.janitor
                .cleanup(&region, age)
                .await
                .map_err(|err| OperationFailure::new(operation_id, region.clone(), err.into()))
        })
        .await
    }

    /// Reclaims every registry entry in `region_code` and revokes any live
    /// grant under this tool's naming convention. Best effort.
    ///
    /// # Errors
    ///
    /// As for [`Orchestrator::cleanup`].
    pub async fn emergency_cleanup(
        &self,
        region_code: &str,
    ) -> Result<CleanupSummary, OperationFailure> {
        let operation_id = OperationId::new();
        let region = self.regions.resolve(region_code);
        traced(operation_id, &region, "emergency_cleanup", async {
            self.verify(&region)
                .await
                .map_err(|err| OperationFailure::new(operation_id, region.clone(), err))?;
            self.janitor
                .emergency_cleanup(&region)
                .await
                .map_err(|err| OperationFailure::new(operation_id, region.clone(), err.into()))
        })
        .await
    }

    fn begin(&self, selector: &Selector) -> (OperationId, String) {
        (OperationId::new(), self.regions.resolve(&selector.region))
    }

    async fn verify(&self, region: &str) -> Result<(), OpsError> {
        self.credentials
            .verify(region)
            .await
            .map_err(|err| OpsError::from_backend(err, region, OpsError::ControlPlane))
    }

    async fn single(
        &self,
        operation_id: OperationId,
        selector: &Selector,
        region: &str,
    ) -> Result<Target, OperationFailure> {
        let fail = |err| OperationFailure::new(operation_id, selector.to_string(), err);
        self.verify(region).await.map_err(fail)?;
        self.resolver
            .select_one(&selector.identifier, region, selector.filter.as_ref())
            .await
            .map_err(fail)
    }

    async fn fleet(
        &self,
        operation_id: OperationId,
        selector: &Selector,
        region: &str,
    ) -> Result<Vec<Target>, OperationFailure> {
        let fail = |err| OperationFailure::new(operation_id, selector.to_string(), err);
        self.verify(region).await.map_err(fail)?;
        self.resolver
            .select(&selector.identifier, region, selector.filter.as_ref())
            .await
            .map(Selection::into_targets)
            .map_err(fail)
    }
}

async fn traced<T>(
    operation_id: OperationId,
    region: &str,
    kind: &'static str,
    work: impl Future<Output = Result<T, OperationFailure>>,
) -> Result<T, OperationFailure> {
    let span = info_span!("operation", %operation_id, region, kind);
    async {
        let outcome = work.await;
        match &outcome {
            Ok(_) => info!("operation finished"),
            Err(failure) => {
                info!(target = %failure.target, error = %failure.error, "operation failed");
            }
        }
        outcome
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests;
