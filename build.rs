//! Build script rendering the `gangway-janitor` manual page.
//!
//! The page lands in `OUT_DIR` next to the other build products so packaging
//! can pick it up without running the binary.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const MAN_PAGE: &str = "gangway-janitor.1";

/// Sources that shape the janitor's command line.
const JANITOR_SOURCES: [&str; 3] = ["build.rs", "src/cli/mod.rs", "src/bin/gangway-janitor.rs"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout().lock();
    for source in JANITOR_SOURCES {
        writeln!(stdout, "cargo::rerun-if-changed={source}")?;
    }

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let mut page = Vec::new();
    Man::new(Cli::command()).render(&mut page)?;
    fs::write(out_dir.join(MAN_PAGE), page)?;
    Ok(())
}
