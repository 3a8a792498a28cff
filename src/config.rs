//! Configuration loading via `ortho-config` and the validated [`Policy`].

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::telemetry::LogFormat;

/// Default region used when the caller supplies an empty region code.
pub const DEFAULT_REGION: &str = "ca-central-1";

/// Default payload size at which transfers switch to the relay (1 MiB).
pub const DEFAULT_DIRECT_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// Default registry location.
pub const DEFAULT_REGISTRY_PATH: &str = "~/.gangway/registry.json";

/// Layered settings: defaults, `gangway.toml`, then `GANGWAY_*` variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "GANGWAY",
    discovery(
        app_name = "gangway",
        env_var = "GANGWAY_CONFIG_PATH",
        config_file_name = "gangway.toml",
        dotfile_name = ".gangway.toml",
        project_file_name = "gangway.toml"
    )
)]
pub struct GangwayConfig {
    /// Region used when no region code is given.
    #[ortho_config(default = DEFAULT_REGION.to_owned())]
    pub default_region: String,
    /// Path to the `aws` executable.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Named credential profile passed to every CLI call.
    pub aws_profile: Option<String>,
    /// Bucket used for relayed transfers. Required only for large payloads.
    pub relay_bucket: Option<String>,
    /// Key prefix under which relay objects are created.
    #[ortho_config(default = "gangway-relay".to_owned())]
    pub relay_prefix: String,
    /// Naming convention for temporary grants; emergency cleanup scans it.
    #[ortho_config(default = "gangway-grant-".to_owned())]
    pub grant_prefix: String,
    /// Payloads of at least this many bytes use the relay.
    #[ortho_config(default = DEFAULT_DIRECT_THRESHOLD_BYTES)]
    pub direct_threshold_bytes: u64,
    /// Upper bound accepted for command timeouts.
    #[ortho_config(default = 3600)]
    pub max_command_timeout_secs: u64,
    /// Simultaneous in-flight commands during fan-out.
    #[ortho_config(default = 16)]
    pub max_concurrency: usize,
    /// Extra attempts after a transient control-plane failure.
    #[ortho_config(default = 2)]
    pub transient_retries: u32,
    /// Minimum age before routine cleanup reclaims an entry.
    #[ortho_config(default = 86_400)]
    pub cleanup_older_than_secs: u64,
    /// Delay between command status polls.
    #[ortho_config(default = 2)]
    pub poll_interval_secs: u64,
    /// Registry file; supports a leading `~/`.
    #[ortho_config(default = DEFAULT_REGISTRY_PATH.to_owned())]
    pub registry_path: String,
    /// Default log filter when `RUST_LOG` is unset.
    #[ortho_config(default = "info".to_owned())]
    pub log_level: String,
    /// `pretty` or `json`.
    #[ortho_config(default = "pretty".to_owned())]
    pub log_format: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to gangway.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "{} {reason}: check {} or {} in gangway.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl GangwayConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("gangway")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank required values and
    /// [`ConfigError::Invalid`] for out-of-range numbers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.default_region,
                FieldMetadata::new("default region", "GANGWAY_DEFAULT_REGION", "default_region"),
            ),
            (
                &self.aws_bin,
                FieldMetadata::new("aws CLI path", "GANGWAY_AWS_BIN", "aws_bin"),
            ),
            (
                &self.relay_prefix,
                FieldMetadata::new("relay key prefix", "GANGWAY_RELAY_PREFIX", "relay_prefix"),
            ),
            (
                &self.grant_prefix,
                FieldMetadata::new("grant name prefix", "GANGWAY_GRANT_PREFIX", "grant_prefix"),
            ),
            (
                &self.registry_path,
                FieldMetadata::new("registry path", "GANGWAY_REGISTRY_PATH", "registry_path"),
            ),
        ];
        for (value, metadata) in &required {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }

        if self
            .relay_bucket
            .as_deref()
            .is_some_and(|bucket| bucket.trim().is_empty())
        {
            return Err(
                FieldMetadata::new("relay bucket", "GANGWAY_RELAY_BUCKET", "relay_bucket")
                    .missing(),
            );
        }
        if self.direct_threshold_bytes == 0 {
            return Err(FieldMetadata::new(
                "direct transfer threshold",
                "GANGWAY_DIRECT_THRESHOLD_BYTES",
                "direct_threshold_bytes",
            )
            .invalid("must be greater than zero"));
        }
        if self.max_command_timeout_secs == 0 {
            return Err(FieldMetadata::new(
                "maximum command timeout",
                "GANGWAY_MAX_COMMAND_TIMEOUT_SECS",
                "max_command_timeout_secs",
            )
            .invalid("must be greater than zero"));
        }
        if self.max_concurrency == 0 {
            return Err(FieldMetadata::new(
                "fan-out concurrency",
                "GANGWAY_MAX_CONCURRENCY",
                "max_concurrency",
            )
            .invalid("must be greater than zero"));
        }
        if self.poll_interval_secs == 0 {
            return Err(FieldMetadata::new(
                "command poll interval",
                "GANGWAY_POLL_INTERVAL_SECS",
                "poll_interval_secs",
            )
            .invalid("must be at least one second"));
        }
        if LogFormat::parse(&self.log_format).is_none() {
            return Err(
                FieldMetadata::new("log format", "GANGWAY_LOG_FORMAT", "log_format")
                    .invalid("must be 'pretty' or 'json'"),
            );
        }
        Ok(())
    }

    /// Validates and converts the configuration into a [`Policy`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        self.validate()?;
        Ok(Policy {
            default_region: self.default_region.trim().to_owned(),
            relay_prefix: self.relay_prefix.trim().trim_end_matches('/').to_owned(),
            grant_prefix: self.grant_prefix.trim().to_owned(),
            direct_threshold_bytes: self.direct_threshold_bytes,
            max_command_timeout: Duration::from_secs(self.max_command_timeout_secs),
            max_concurrency: self.max_concurrency,
            transient_retries: self.transient_retries,
            cleanup_older_than: Duration::from_secs(self.cleanup_older_than_secs),
            ..Policy::default()
        })
    }

    /// Registry path with a leading `~/` expanded.
    #[must_use]
    pub fn registry_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(self.registry_path.trim()))
    }

    /// Interval between command status polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Validated operating limits handed to every component constructor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Policy {
    /// Region used for empty region codes.
    pub default_region: String,
    /// Relay key prefix without a trailing slash.
    pub relay_prefix: String,
    /// Grant naming prefix.
    pub grant_prefix: String,
    /// Payloads at or above this size are relayed.
    pub direct_threshold_bytes: u64,
    /// Upper bound for command timeouts.
    pub max_command_timeout: Duration,
    /// Fan-out concurrency cap.
    pub max_concurrency: usize,
    /// Retries after transient control-plane failures.
    pub transient_retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub retry_backoff: Duration,
    /// Slack added to fan-out deadlines beyond the command timeouts.
    pub fanout_grace: Duration,
    /// Default routine cleanup age.
    pub cleanup_older_than: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            default_region: DEFAULT_REGION.to_owned(),
            relay_prefix: String::from("gangway-relay"),
            grant_prefix: String::from("gangway-grant-"),
            direct_threshold_bytes: DEFAULT_DIRECT_THRESHOLD_BYTES,
            max_command_timeout: Duration::from_secs(3600),
            max_concurrency: 16,
            transient_retries: 2,
            retry_backoff: Duration::from_millis(500),
            fanout_grace: Duration::from_secs(30),
            cleanup_older_than: Duration::from_secs(86_400),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
