//! Durable record of every temporary artifact the orchestrator creates.
//!
//! Entries are appended before the artifact they describe becomes reachable
//! and removed once teardown completes. Anything left behind belongs to an
//! operation that crashed or failed to tear down, and is reclaimed by
//! [`crate::cleanup::Janitor`] from this record alone.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::OperationId;

mod file;
mod memory;

pub use file::FileRegistry;
pub use memory::MemoryRegistry;

/// Kind of reclaimable artifact.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A temporary grant attached to a target identity.
    Grant,
    /// A relay object in object storage.
    RelayObject,
    /// An advisory marker for an in-flight operation.
    LockMarker,
}

impl ResourceKind {
    /// Stable name used in entry ids.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::RelayObject => "relay",
            Self::LockMarker => "lock",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reclaimable resource.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegistryEntry {
    /// Artifact kind.
    pub kind: ResourceKind,
    /// Grant id, relay key, or lock resource key.
    pub key: String,
    /// Region the artifact lives in.
    pub region: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Operation that created the artifact.
    pub operation_id: OperationId,
    /// Instance a grant is attached to; unused for other kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Bucket of a relay object; unused for other kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

impl RegistryEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(
        kind: ResourceKind,
        key: impl Into<String>,
        region: impl Into<String>,
        operation_id: OperationId,
    ) -> Self {
        Self {
            kind,
            key: key.into(),
            region: region.into(),
            created_at: Utc::now(),
            operation_id,
            subject: None,
            bucket: None,
        }
    }

    /// Records the instance a grant is attached to.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Records the bucket holding a relay object.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Overrides the registration time.
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Unique id: `<kind>:<key>`.
    #[must_use]
    pub fn id(&self) -> String {
        entry_id(self.kind, &self.key)
    }

    /// Age at `now`; entries stamped in the future have zero age.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Builds the registry id for an artifact.
#[must_use]
pub fn entry_id(kind: ResourceKind, key: &str) -> String {
    format!("{}:{key}", kind.as_str())
}

/// Errors raised by registry stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// File system access failed.
    #[error("failed to access registry {path}: {message}")]
    Io {
        /// Registry path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The stored record could not be parsed or rendered.
    #[error("registry {path} is corrupt: {message}")]
    Corrupt {
        /// Registry path.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
}

/// Storage contract for registry entries.
///
/// Implementations serialise mutations so no caller observes a partially
/// written entry. `register` and `deregister` are idempotent.
pub trait Registry: Send + Sync {
    /// Records `entry`. Re-registering an existing id keeps the original.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be updated.
    fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError>;

    /// Removes the entry with `id`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be updated.
    fn deregister(&self, id: &str) -> Result<bool, RegistryError>;

    /// Fetches a single entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read.
    fn get(&self, id: &str) -> Result<Option<RegistryEntry>, RegistryError>;

    /// Lists every entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read.
    fn list_all(&self) -> Result<Vec<RegistryEntry>, RegistryError>;

    /// Lists entries for `region`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read.
    fn list(&self, region: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|entry| entry.region == region)
            .collect())
    }

    /// Lists entries for `region` whose age at `now` is at least
    /// `older_than`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read.
    fn list_older_than(
        &self,
        region: &str,
        older_than: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<RegistryEntry>, RegistryError> {
        let mut entries = self
            .list(region)?
            .into_iter()
            .filter(|entry| entry.age(now) >= older_than)
            .collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    /// Lists entries created by `operation_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read.
    fn list_for_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|entry| entry.operation_id == operation_id)
            .collect())
    }
}
