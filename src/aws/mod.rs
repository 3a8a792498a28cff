//! AWS implementations of the collaborator seams.
//!
//! Every call shells out to the `aws` CLI through a [`CommandRunner`], with
//! JSON output parsed by `serde_json`. The remote-management agent is AWS
//! Systems Manager; relay objects live in S3 and temporary grants are inline
//! IAM policies on the role behind a target's instance profile.
//!
//! CLI failures are classified from stderr so the orchestrator can tell
//! rejected credentials (fatal) from throttling (retried) and missing
//! resources (often benign during teardown).

use std::ffi::OsString;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::backend::{BackendError, BackendFuture, CredentialCheck};
use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner};
use crate::config::GangwayConfig;

mod agent;
mod grant;
mod inventory;
mod relay;
mod scripts;

/// Default `aws` CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Largest payload carried inline in an agent command.
///
/// Agent command output is truncated at 24 000 characters, which caps
/// direct reads once base64 overhead is added.
pub const DIRECT_PAYLOAD_LIMIT: u64 = 16 * 1024;

const CREDENTIAL_MARKERS: &[&str] = &[
    "ExpiredToken",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "SignatureDoesNotMatch",
    "InvalidSignatureException",
    "AuthFailure",
    "Unable to locate credentials",
    "security token included in the request is invalid",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "Throttling",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "InternalError",
    "SlowDown",
    "RequestTimeout",
    "Could not connect to the endpoint URL",
    "Connection was closed",
    "Read timeout",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvocationDoesNotExist",
    "NoSuchEntity",
    "NoSuchKey",
    "(404)",
];

/// Collaborator implementation backed by the `aws` CLI.
#[derive(Clone, Debug)]
pub struct AwsBackend<R: CommandRunner> {
    runner: R,
    bin: String,
    profile: Option<String>,
    relay_bucket: Option<String>,
    poll_interval: Duration,
}

impl AwsBackend<ProcessCommandRunner> {
    /// Creates a backend wired to the real process runner.
    #[must_use]
    pub fn from_config(config: &GangwayConfig) -> Self {
        Self::new(ProcessCommandRunner, config.aws_bin.clone())
            .with_profile(config.aws_profile.clone())
            .with_relay_bucket(config.relay_bucket.clone())
            .with_poll_interval(config.poll_interval())
    }
}

impl<R: CommandRunner> AwsBackend<R> {
    /// Creates a backend that invokes `bin` through `runner`.
    #[must_use]
    pub fn new(runner: R, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
            profile: None,
            relay_bucket: None,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Selects a named CLI profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile.filter(|name| !name.trim().is_empty());
        self
    }

    /// Sets the bucket holding relay objects.
    #[must_use]
    pub fn with_relay_bucket(mut self, bucket: Option<String>) -> Self {
        self.relay_bucket = bucket.filter(|name| !name.trim().is_empty());
        self
    }

    /// Sets the delay between command status polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn args(&self, region: &str, service_args: Vec<String>) -> Vec<OsString> {
        let mut args = service_args
            .into_iter()
            .map(OsString::from)
            .collect::<Vec<_>>();
        args.push(OsString::from("--region"));
        args.push(OsString::from(region));
        args.push(OsString::from("--output"));
        args.push(OsString::from("json"));
        if let Some(profile) = &self.profile {
            args.push(OsString::from("--profile"));
            args.push(OsString::from(profile));
        }
        args
    }

    /// Runs the CLI and returns stdout, classifying failures.
    async fn call(
        &self,
        region: &str,
        resource: &str,
        service_args: Vec<String>,
    ) -> Result<String, BackendError> {
        let args = self.args(region, service_args);
        debug!(program = %self.bin, resource, "invoking aws cli");
        let output = self.runner.run(&self.bin, &args).await?;
        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(&self.bin, resource, &output))
        }
    }

    async fn call_json<T>(
        &self,
        region: &str,
        resource: &str,
        service_args: Vec<String>,
    ) -> Result<T, BackendError>
    where
        T: DeserializeOwned,
    {
        let stdout = self.call(region, resource, service_args).await?;
        parse_json(resource, &stdout)
    }
}

fn parse_json<T: DeserializeOwned>(resource: &str, stdout: &str) -> Result<T, BackendError> {
    serde_json::from_str(stdout).map_err(|err| BackendError::Parse {
        resource: resource.to_owned(),
        message: err.to_string(),
    })
}

/// Maps a failed CLI invocation to a [`BackendError`] from its stderr.
pub(crate) fn classify_failure(
    program: &str,
    resource: &str,
    output: &CommandOutput,
) -> BackendError {
    let stderr = output.stderr.trim();
    let mentions = |markers: &[&str]| markers.iter().any(|marker| stderr.contains(marker));
    if mentions(CREDENTIAL_MARKERS) {
        BackendError::Credential {
            message: stderr.to_owned(),
        }
    } else if mentions(TRANSIENT_MARKERS) {
        BackendError::Transient {
            message: stderr.to_owned(),
        }
    } else if mentions(NOT_FOUND_MARKERS) {
        BackendError::NotFound {
            resource: resource.to_owned(),
            id: stderr.to_owned(),
        }
    } else {
        BackendError::CommandFailure {
            program: program.to_owned(),
            status: output.code,
            status_text: output.status_text(),
            stderr: format!("{resource}: {stderr}"),
        }
    }
}

fn svc(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_owned()).collect()
}

impl<R: CommandRunner> CredentialCheck for AwsBackend<R> {
    fn verify<'a>(&'a self, region: &'a str) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.call(region, "caller identity", svc(&["sts", "get-caller-identity"]))
                .await
                .map(|_identity| ())
        })
    }
}

#[cfg(test)]
mod tests;
