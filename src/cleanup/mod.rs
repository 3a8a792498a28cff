//! Registry-driven reclamation of temporary artifacts.
//!
//! The janitor works only from the durable registry, never from live
//! operation state, so it can repair the aftermath of a process that
//! crashed mid-transfer. Routine cleanup honours an age threshold so
//! artifacts of in-flight operations are left alone. Emergency cleanup
//! ignores age and additionally scans live identities for grants that follow
//! the configured naming convention; that scan is best-effort and cannot
//! find grants named outside the convention.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendError, GrantStore, RelayLocation, RelayStore};
use crate::config::Policy;
use crate::operation::OperationId;
use crate::registry::{Registry, RegistryEntry, RegistryError, ResourceKind};
use crate::retry::{RetryBudget, with_retries};

/// Upper bound on a single reclamation call.
const RECLAIM_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// One artifact the janitor could not reclaim.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CleanupFailure {
    /// Registry id, or a description for unregistered grants.
    pub entry: String,
    /// Why reclamation failed.
    pub message: String,
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CleanupSummary {
    /// Grants revoked, registered or discovered.
    pub revoked_grants: usize,
    /// Relay objects deleted.
    pub deleted_relay_objects: usize,
    /// Lock markers removed.
    pub removed_lock_markers: usize,
    /// Entries that vanished before the janitor reached them.
    pub skipped: usize,
    /// Operations whose lock marker showed they never finished teardown.
    pub interrupted_operations: Vec<OperationId>,
    /// Artifacts still in place.
    pub failures: Vec<CleanupFailure>,
}

impl CleanupSummary {
    const fn count_reclaimed(&mut self, kind: ResourceKind) {
        match kind {
            ResourceKind::Grant => self.revoked_grants += 1,
            ResourceKind::RelayObject => self.deleted_relay_objects += 1,
            ResourceKind::LockMarker => self.removed_lock_markers += 1,
        }
    }

    /// Returns `true` when nothing was left behind.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CleanupError {
    /// Some artifacts could not be reclaimed; the rest were.
    #[error("cleanup incomplete: {} artifact(s) remain", .summary.failures.len())]
    Incomplete {
        /// Everything that was and was not reclaimed.
        summary: Box<CleanupSummary>,
    },
    /// The registry could not be read.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Reclaims grants, relay objects and lock markers recorded in the registry.
#[derive(Clone)]
pub struct Janitor {
    relay: Arc<dyn RelayStore>,
    grants: Arc<dyn GrantStore>,
    registry: Arc<dyn Registry>,
    policy: Policy,
}

impl Janitor {
    /// Creates a janitor.
    #[must_use]
    pub fn new(
        relay: Arc<dyn RelayStore>,
        grants: Arc<dyn GrantStore>,
        registry: Arc<dyn Registry>,
        policy: Policy,
    ) -> Self {
        Self {
            relay,
            grants,
            registry,
            policy,
        }
    }

    /// Reclaims entries in `region` at least `older_than` old.
    ///
    /// Grants go first, then relay objects, then lock markers. One failing
    /// entry never stops the rest. Running it twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Incomplete`] when any artifact remains and
    /// [`CleanupError::Registry`] when the registry cannot be read.
    pub async fn cleanup(
        &self,
        region: &str,
        older_than: Duration,
    ) -> Result<CleanupSummary, CleanupError> {
        let summary = self.reclaim(region, older_than, Utc::now()).await?;
        finish(region, summary)
    }

    /// Reclaims every entry in `region` regardless of age, then revokes any
    /// grant still attached to a live identity under the naming convention.
    ///
    /// # Errors
    ///
    /// As for [`Janitor::cleanup`].
    pub async fn emergency_cleanup(&self, region: &str) -> Result<CleanupSummary, CleanupError> {
        let mut summary = self.reclaim(region, Duration::ZERO, Utc::now()).await?;
        self.revoke_unregistered(region, &mut summary).await;
        finish(region, summary)
    }

    async fn reclaim(
        &self,
        region: &str,
        older_than: Duration,
        now: DateTime<Utc>,
    ) -> Result<CleanupSummary, CleanupError> {
        let mut entries = self.registry.list_older_than(region, older_than, now)?;
        entries.sort_by_key(|entry| reclaim_order(entry.kind));

        let mut summary = CleanupSummary::default();
        let mut unfinished = BTreeSet::new();
        for entry in entries {
            let id = entry.id();
            if self.registry.get(&id)?.is_none() {
                summary.skipped += 1;
                continue;
            }
            if entry.kind == ResourceKind::LockMarker {
                self.release_lock(&entry, &unfinished, &mut summary)?;
                continue;
            }
            match self.reclaim_artifact(region, &entry).await {
                Ok(()) => {
                    self.registry.deregister(&id)?;
                    summary.count_reclaimed(entry.kind);
                }
                Err(message) => {
                    unfinished.insert(entry.operation_id);
                    record_failure(&mut summary, id, message);
                }
            }
        }
        Ok(summary)
    }

    async fn reclaim_artifact(&self, region: &str, entry: &RegistryEntry) -> Result<(), String> {
        match entry.kind {
            ResourceKind::Grant => self.revoke_entry(region, entry).await,
            ResourceKind::RelayObject => self.delete_entry(region, entry).await,
            ResourceKind::LockMarker => Ok(()),
        }
    }

    /// Removes a lock marker once nothing else of its operation remains.
    fn release_lock(
        &self,
        entry: &RegistryEntry,
        unfinished: &BTreeSet<OperationId>,
        summary: &mut CleanupSummary,
    ) -> Result<(), RegistryError> {
        if unfinished.contains(&entry.operation_id) || self.has_artifacts(entry.operation_id)? {
            return Ok(());
        }
        if self.registry.deregister(&entry.id())? {
            summary.removed_lock_markers += 1;
            summary.interrupted_operations.push(entry.operation_id);
            info!(operation_id = %entry.operation_id, "removed lock marker of interrupted operation");
        } else {
            summary.skipped += 1;
        }
        Ok(())
    }

    fn has_artifacts(&self, operation_id: OperationId) -> Result<bool, RegistryError> {
        Ok(self
            .registry
            .list_for_operation(operation_id)?
            .iter()
            .any(|entry| entry.kind != ResourceKind::LockMarker))
    }

    async fn revoke_entry(&self, region: &str, entry: &RegistryEntry) -> Result<(), String> {
        let Some(subject) = entry.subject.as_deref() else {
            return Err(String::from("grant entry does not name its instance"));
        };
        self.call("grant revoke", || {
            self.grants.revoke(region, subject, &entry.key)
        })
        .await?;
        info!(region, grant = %entry.key, instance = subject, "revoked grant");
        Ok(())
    }

    async fn delete_entry(&self, region: &str, entry: &RegistryEntry) -> Result<(), String> {
        let Some(bucket) = entry.bucket.clone() else {
            return Err(String::from("relay entry does not name its bucket"));
        };
        let location = RelayLocation {
            bucket,
            key: entry.key.clone(),
        };
        self.call("relay delete", || self.relay.delete(region, &location))
            .await?;
        info!(region, object = %location, "deleted relay object");
        Ok(())
    }

    async fn revoke_unregistered(&self, region: &str, summary: &mut CleanupSummary) {
        let prefix = self.policy.grant_prefix.as_str();
        let live = match self
            .call("live grant scan", || self.grants.list_live(region, prefix))
            .await
        {
            Ok(live) => live,
            Err(message) => {
                record_failure(summary, format!("live grants with prefix {prefix}"), message);
                return;
            }
        };
        for grant in live {
            let outcome = self
                .call("grant revoke", || {
                    self.grants.revoke(region, &grant.target_id, &grant.grant_id)
                })
                .await;
            match outcome {
                Ok(()) => {
                    warn!(region, grant = %grant.grant_id, instance = %grant.target_id, "revoked unregistered grant");
                    summary.revoked_grants += 1;
                }
                Err(message) => record_failure(
                    summary,
                    format!("grant:{} on {}", grant.grant_id, grant.target_id),
                    message,
                ),
            }
        }
    }

    async fn call<T, F, Fut>(&self, activity: &str, call: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let detached = CancellationToken::new();
        let budget = RetryBudget::from_policy(&self.policy);
        match tokio::time::timeout(
            RECLAIM_CALL_TIMEOUT,
            with_retries(budget, activity, &detached, call),
        )
        .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_elapsed) => Err(format!(
                "{activity} gave no answer after {}s",
                RECLAIM_CALL_TIMEOUT.as_secs()
            )),
        }
    }
}

const fn reclaim_order(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Grant => 0,
        ResourceKind::RelayObject => 1,
        ResourceKind::LockMarker => 2,
    }
}

fn record_failure(summary: &mut CleanupSummary, entry: String, message: String) {
    warn!(entry = %entry, error = %message, "could not reclaim");
    summary.failures.push(CleanupFailure { entry, message });
}

fn finish(region: &str, summary: CleanupSummary) -> Result<CleanupSummary, CleanupError> {
    info!(
        region,
        revoked_grants = summary.revoked_grants,
        deleted_relay_objects = summary.deleted_relay_objects,
        removed_lock_markers = summary.removed_lock_markers,
        skipped = summary.skipped,
        failures = summary.failures.len(),
        "cleanup finished"
    );
    if summary.is_clean() {
        Ok(summary)
    } else {
        Err(CleanupError::Incomplete {
            summary: Box::new(summary),
        })
    }
}

#[cfg(test)]
mod tests;
