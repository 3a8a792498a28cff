//! Registry-driven janitor for gangway.
//!
//! This binary reclaims the grants, relay objects and lock markers recorded
//! in the registry for one region, prints a one-line summary, and exits
//! non-zero when anything could not be reclaimed.

use std::fmt::Display;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use gangway::{
    CleanupSummary, GangwayConfig, LogFormat, LoggingConfig, NonInteractivePicker,
    OperationFailure, OpsError, Orchestrator, init_logging,
};

#[path = "../cli/mod.rs"]
mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("logging error: {0}")]
    Logging(String),
    #[error(transparent)]
    Operation(#[from] OperationFailure),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match sweep(&cli).await {
        Ok(summary) => {
            write_summary(io::stdout(), &summary);
            0
        }
        Err(CliError::Operation(failure)) => {
            write_error(io::stderr(), &failure);
            if let OpsError::CleanupIncomplete { summary } = failure.kind() {
                write_summary(io::stdout(), summary);
                write_failures(io::stderr(), summary);
            }
            1
        }
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };

    process::exit(exit_code);
}

async fn sweep(cli: &Cli) -> Result<CleanupSummary, CliError> {
    let config =
        GangwayConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let format = LogFormat::parse(&config.log_format).unwrap_or(LogFormat::Pretty);
    init_logging(&LoggingConfig {
        level: &config.log_level,
        format,
    })
    .map_err(|err| CliError::Logging(err.to_string()))?;

    let orchestrator = Orchestrator::from_config(&config, Arc::new(NonInteractivePicker))
        .map_err(|err| CliError::Config(err.to_string()))?;
    let summary = if cli.emergency {
        orchestrator.emergency_cleanup(&cli.region).await?
    } else {
        let older_than = cli.older_than_secs.map(Duration::from_secs);
        orchestrator.cleanup(&cli.region, older_than).await?
    };
    Ok(summary)
}

fn write_summary(mut target: impl Write, summary: &CleanupSummary) {
    writeln!(
        target,
        "janitor cleanup finished: revoked_grants={}, deleted_relay_objects={}, \
         removed_lock_markers={}, interrupted_operations={}, skipped={}, failures={}",
        summary.revoked_grants,
        summary.deleted_relay_objects,
        summary.removed_lock_markers,
        summary.interrupted_operations.len(),
        summary.skipped,
        summary.failures.len()
    )
    .ok();
}

fn write_error(mut target: impl Write, err: &impl Display) {
    writeln!(target, "{err}").ok();
}

fn write_failures(mut target: impl Write, summary: &CleanupSummary) {
    for failure in &summary.failures {
        writeln!(target, "  {}: {}", failure.entry, failure.message).ok();
    }
}
