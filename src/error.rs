//! Errors surfaced by orchestrator operations.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::cleanup::{CleanupError, CleanupSummary};
use crate::exec::CommandResult;
use crate::operation::OperationId;
use crate::pool::FanOutReport;
use crate::power::PowerResult;
use crate::registry::RegistryError;

/// Typed failure of a single orchestrator operation.
#[derive(Debug, Error)]
pub enum OpsError {
    /// No identifier was given and no interactive picker is available.
    #[error("an instance identifier is required when running non-interactively")]
    IdentifierRequired,
    /// A name matched several instances and no picker could disambiguate.
    #[error("'{identifier}' matches several instances: {}", .candidates.join(", "))]
    Ambiguous {
        /// Name supplied by the caller.
        identifier: String,
        /// Display names of every match.
        candidates: Vec<String>,
    },
    /// No reachable instance matched.
    #[error("no reachable instance matches '{identifier}' in {region}")]
    NotFound {
        /// Identifier supplied by the caller.
        identifier: String,
        /// Region that was searched.
        region: String,
    },
    /// The credential set for the region is unusable.
    #[error("credentials for {region} are invalid or expired: {message}")]
    CredentialInvalid {
        /// Region the credential set is scoped to.
        region: String,
        /// Provider message.
        message: String,
    },
    /// A command or session did not finish in time.
    #[error("{activity} timed out after {}s", .after.as_secs())]
    Timeout {
        /// What timed out.
        activity: String,
        /// Budget that was exceeded.
        after: Duration,
    },
    /// Transferred bytes did not match the source.
    #[error(
        "integrity check failed for {path}: expected {expected_size} bytes, found {actual_size}{}",
        digest_note(.expected_digest.as_deref(), .actual_digest.as_deref())
    )]
    Integrity {
        /// Destination path.
        path: String,
        /// Source size.
        expected_size: u64,
        /// Destination size.
        actual_size: u64,
        /// Source digest.
        expected_digest: Option<String>,
        /// Destination digest, when the channel reports one.
        actual_digest: Option<String>,
    },
    /// Some targets of a command fan-out did not succeed.
    #[error(
        "{} of {} targets did not succeed",
        unsuccessful_commands(.report),
        .report.results.len()
    )]
    PartialFailure {
        /// Every per-target result.
        report: FanOutReport<CommandResult>,
    },
    /// Some targets of a power fan-out did not transition.
    #[error(
        "{} of {} power transitions did not apply",
        unapplied_transitions(.report),
        .report.results.len()
    )]
    PowerPartialFailure {
        /// Every per-target result.
        report: FanOutReport<PowerResult>,
    },
    /// A grant or relay object could not be created.
    #[error("failed to provision {resource}: {message}")]
    Provision {
        /// Artifact being created.
        resource: String,
        /// Underlying failure.
        message: String,
    },
    /// A grant or relay object could not be removed.
    #[error("failed to tear down {resource}: {message}")]
    Teardown {
        /// Artifact being removed.
        resource: String,
        /// Underlying failure.
        message: String,
    },
    /// Bytes could not be moved.
    #[error("transfer failed: {message}")]
    Transfer {
        /// Underlying failure.
        message: String,
    },
    /// An interactive session or tunnel failed or dropped.
    #[error("session failed: {message}")]
    Session {
        /// Underlying failure.
        message: String,
    },
    /// A port is outside `1..=65535`.
    #[error("{side} port {value} is outside 1-65535")]
    InvalidPort {
        /// `local` or `remote`.
        side: &'static str,
        /// Rejected value.
        value: u32,
    },
    /// A timeout is zero or above the configured bound.
    #[error("duration of {}s must be greater than zero and at most {}s", .value.as_secs(), .max.as_secs())]
    InvalidDuration {
        /// Rejected value.
        value: Duration,
        /// Configured upper bound.
        max: Duration,
    },
    /// The caller cancelled, or declined to pick a target.
    #[error("operation cancelled")]
    Cancelled,
    /// The registry could not be read or updated.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A control-plane call failed outside the cases above.
    #[error("control-plane call failed: {0}")]
    ControlPlane(#[source] BackendError),
    /// Cleanup left artifacts in place.
    #[error("cleanup left {} artifacts in place", .summary.failures.len())]
    CleanupIncomplete {
        /// What was and was not reclaimed.
        summary: Box<CleanupSummary>,
    },
}

fn unsuccessful_commands(report: &FanOutReport<CommandResult>) -> usize {
    report.count(|result| !result.is_success())
}

fn unapplied_transitions(report: &FanOutReport<PowerResult>) -> usize {
    report.count(|result| !result.is_applied())
}

fn digest_note(expected: Option<&str>, actual: Option<&str>) -> String {
    match (expected, actual) {
        (Some(want), Some(got)) if want != got => format!(" (sha256 {want} != {got})"),
        _ => String::new(),
    }
}

impl OpsError {
    /// Maps collaborator failures that share a meaning across every
    /// operation, deferring the rest to `fallback`.
    pub(crate) fn from_backend(
        err: BackendError,
        region: &str,
        fallback: impl FnOnce(BackendError) -> Self,
    ) -> Self {
        match err {
            BackendError::Credential { message } => Self::CredentialInvalid {
                region: region.to_owned(),
                message,
            },
            BackendError::Cancelled => Self::Cancelled,
            other => fallback(other),
        }
    }
}

impl From<CleanupError> for OpsError {
    fn from(value: CleanupError) -> Self {
        match value {
            CleanupError::Incomplete { summary } => Self::CleanupIncomplete { summary },
            CleanupError::Registry(err) => Self::Registry(err),
        }
    }
}

/// A fatal error tagged with the operation id and target, suitable for
/// correlating with registry entries.
#[derive(Debug, Error)]
#[error("operation {operation_id} on {target} failed: {error}")]
pub struct OperationFailure {
    /// Operation that failed.
    pub operation_id: OperationId,
    /// Target description, or the selector when no target was resolved.
    pub target: String,
    /// What went wrong.
    #[source]
    pub error: Box<OpsError>,
}

impl OperationFailure {
    /// Wraps `error` for `operation_id` and `target`.
    #[must_use]
    pub fn new(operation_id: OperationId, target: impl Into<String>, error: OpsError) -> Self {
        Self {
            operation_id,
            target: target.into(),
            error: Box::new(error),
        }
    }

    /// The underlying error.
    #[must_use]
    pub fn kind(&self) -> &OpsError {
        &self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn credential_failures_map_to_credential_invalid() {
        let err = OpsError::from_backend(
            BackendError::Credential {
                message: String::from("ExpiredToken"),
            },
            "ca-central-1",
            OpsError::ControlPlane,
        );
        assert!(matches!(
            err,
            OpsError::CredentialInvalid { ref region, .. } if region == "ca-central-1"
        ));
    }

    #[rstest]
    fn other_failures_use_the_fallback() {
        let err = OpsError::from_backend(
            BackendError::Transient {
                message: String::from("Throttling"),
            },
            "ca-central-1",
            |inner| OpsError::Transfer {
                message: inner.to_string(),
            },
        );
        assert!(matches!(err, OpsError::Transfer { .. }));
    }

    #[rstest]
    fn integrity_message_names_both_digests() {
        let err = OpsError::Integrity {
            path: String::from("/tmp/a"),
            expected_size: 4,
            actual_size: 4,
            expected_digest: Some(String::from("aa")),
            actual_digest: Some(String::from("bb")),
        };
        assert_eq!(
            err.to_string(),
            "integrity check failed for /tmp/a: expected 4 bytes, found 4 (sha256 aa != bb)"
        );
    }

    #[rstest]
    fn operation_failures_name_the_operation_and_target() {
        let operation_id = OperationId::new();
        let failure = OperationFailure::new(operation_id, "web (i-0123abcd)", OpsError::Cancelled);
        let rendered = failure.to_string();
        assert!(rendered.contains(&operation_id.to_string()));
        assert!(rendered.contains("web (i-0123abcd)"));
    }
}
