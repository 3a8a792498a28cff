//! Command-line interface definitions for the `gangway-janitor` binary.
//!
//! This module isolates the clap parser structures so the build script can
//! reuse them when generating the manual page.

use clap::Parser;

/// Reclaims grants, relay objects and lock markers left by interrupted
/// operations.
#[derive(Debug, Parser)]
#[command(
    name = "gangway-janitor",
    about = "Reclaim temporary grants and relay objects left behind by gangway operations"
)]
pub(crate) struct Cli {
    /// Region code, short (`cac1`) or canonical (`ca-central-1`). Defaults
    /// to the configured default region.
    #[arg(long, env = "GANGWAY_REGION", default_value = "")]
    pub(crate) region: String,
    /// Minimum entry age in seconds. Defaults to the configured cleanup age.
    #[arg(long, value_name = "SECONDS", conflicts_with = "emergency")]
    pub(crate) older_than_secs: Option<u64>,
    /// Ignore entry age and also revoke unregistered grants that follow the
    /// naming convention.
    #[arg(long)]
    pub(crate) emergency: bool,
}
