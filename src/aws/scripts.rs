//! Agent-side scripts for the transfer primitives.
//!
//! Each script that leaves a file behind prints `<bytes> <sha256>` on its
//! last line so the caller can verify what actually landed. A missing source
//! file exits with [`MISSING_FILE_EXIT`].

use std::borrow::Cow;

use shell_escape::unix::escape;

use crate::backend::{RelayLocation, RemoteFile};
use crate::target::Platform;

/// Exit status the scripts use for "no such file".
pub(super) const MISSING_FILE_EXIT: i32 = 3;

/// Attempts the target makes to reach a relay object before giving up.
///
/// Freshly attached grants take a few seconds to propagate.
const RELAY_ATTEMPTS: u32 = 5;
const RELAY_RETRY_DELAY_SECS: u32 = 3;

const POSIX_REPORT: &str = r#"report() { printf '%s %s\n' "$(wc -c < "$1" | tr -d ' ')" "$(sha256sum "$1" | cut -d ' ' -f 1)"; }"#;
const POWERSHELL_REPORT: &str = r#"function Report($p) { $h = (Get-FileHash -LiteralPath $p -Algorithm SHA256).Hash.ToLower(); Write-Output "$((Get-Item -LiteralPath $p).Length) $h" }"#;

fn sh(value: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(value))
}

/// Single-quotes a PowerShell literal.
fn ps(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(super) fn stat_script(platform: Platform, path: &str) -> String {
    match platform {
        Platform::Linux => [
            POSIX_REPORT.to_owned(),
            format!("f={}", sh(path)),
            format!(r#"[ -f "$f" ] || exit {MISSING_FILE_EXIT}"#),
            String::from(r#"report "$f""#),
        ]
        .join("\n"),
        Platform::Windows => [
            POWERSHELL_REPORT.to_owned(),
            format!("$f = {}", ps(path)),
            format!("if (-not (Test-Path -LiteralPath $f -PathType Leaf)) {{ exit {MISSING_FILE_EXIT} }}"),
            String::from("Report $f"),
        ]
        .join("\n"),
    }
}

pub(super) fn write_script(platform: Platform, path: &str, encoded: &str) -> String {
    match platform {
        Platform::Linux => [
            String::from("set -e"),
            POSIX_REPORT.to_owned(),
            format!("f={}", sh(path)),
            String::from(r#"mkdir -p "$(dirname "$f")""#),
            format!(r#"printf '%s' '{encoded}' | base64 -d > "$f""#),
            String::from(r#"report "$f""#),
        ]
        .join("\n"),
        Platform::Windows => [
            String::from("$ErrorActionPreference = 'Stop'"),
            POWERSHELL_REPORT.to_owned(),
            format!("$f = {}", ps(path)),
            String::from(
                "$d = Split-Path -Parent $f; if ($d) { New-Item -ItemType Directory -Force -Path $d | Out-Null }",
            ),
            format!("[IO.File]::WriteAllBytes($f, [Convert]::FromBase64String('{encoded}'))"),
            String::from("Report $f"),
        ]
        .join("\n"),
    }
}

pub(super) fn read_script(platform: Platform, path: &str) -> String {
    match platform {
        Platform::Linux => [
            format!("f={}", sh(path)),
            format!(r#"[ -f "$f" ] || exit {MISSING_FILE_EXIT}"#),
            String::from(r#"base64 < "$f" | tr -d '\n'"#),
        ]
        .join("\n"),
        Platform::Windows => [
            format!("$f = {}", ps(path)),
            format!("if (-not (Test-Path -LiteralPath $f -PathType Leaf)) {{ exit {MISSING_FILE_EXIT} }}"),
            String::from("[Convert]::ToBase64String([IO.File]::ReadAllBytes($f))"),
        ]
        .join("\n"),
    }
}

/// Copies a relay object onto the target, retrying while the grant settles.
pub(super) fn pull_script(
    platform: Platform,
    location: &RelayLocation,
    path: &str,
    region: &str,
) -> String {
    let uri = location.uri();
    match platform {
        Platform::Linux => [
            POSIX_REPORT.to_owned(),
            format!("f={}", sh(path)),
            String::from(r#"mkdir -p "$(dirname "$f")""#),
            String::from("n=0"),
            format!(
                r#"until aws s3 cp {} "$f" --region {} --only-show-errors; do"#,
                sh(&uri),
                sh(region)
            ),
            posix_backoff(),
            String::from("done"),
            String::from(r#"report "$f""#),
        ]
        .join("\n"),
        Platform::Windows => [
            POWERSHELL_REPORT.to_owned(),
            format!("$f = {}", ps(path)),
            String::from(
                "$d = Split-Path -Parent $f; if ($d) { New-Item -ItemType Directory -Force -Path $d | Out-Null }",
            ),
            powershell_loop(&format!(
                "aws s3 cp {} $f --region {} --only-show-errors",
                ps(&uri),
                ps(region)
            )),
            String::from("Report $f"),
        ]
        .join("\n"),
    }
}

/// Copies a target file into a relay object.
pub(super) fn push_script(
    platform: Platform,
    path: &str,
    location: &RelayLocation,
    region: &str,
) -> String {
    let uri = location.uri();
    match platform {
        Platform::Linux => [
            format!("f={}", sh(path)),
            format!(r#"[ -f "$f" ] || exit {MISSING_FILE_EXIT}"#),
            String::from("n=0"),
            format!(
                r#"until aws s3 cp "$f" {} --region {} --only-show-errors; do"#,
                sh(&uri),
                sh(region)
            ),
            posix_backoff(),
            String::from("done"),
        ]
        .join("\n"),
        Platform::Windows => [
            format!("$f = {}", ps(path)),
            format!("if (-not (Test-Path -LiteralPath $f -PathType Leaf)) {{ exit {MISSING_FILE_EXIT} }}"),
            powershell_loop(&format!(
                "aws s3 cp $f {} --region {} --only-show-errors",
                ps(&uri),
                ps(region)
            )),
        ]
        .join("\n"),
    }
}

fn posix_backoff() -> String {
    format!(
        r#"  n=$((n + 1)); [ "$n" -ge {RELAY_ATTEMPTS} ] && exit 1; sleep {RELAY_RETRY_DELAY_SECS}"#
    )
}

fn powershell_loop(command: &str) -> String {
    format!(
        "$n = 0; while ($true) {{ {command}; if ($LASTEXITCODE -eq 0) {{ break }}; $n++; if ($n -ge {RELAY_ATTEMPTS}) {{ exit 1 }}; Start-Sleep -Seconds {RELAY_RETRY_DELAY_SECS} }}"
    )
}

/// Parses the `<bytes> <sha256>` report from the last output line.
pub(super) fn parse_report(stdout: &str) -> Option<RemoteFile> {
    let line = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    let mut fields = line.split_whitespace();
    let size = fields.next()?.parse::<u64>().ok()?;
    let digest = fields.next()?.to_ascii_lowercase();
    let is_digest = digest.len() == 64 && digest.chars().all(|ch| ch.is_ascii_hexdigit());
    is_digest.then_some(RemoteFile {
        size,
        digest: Some(digest),
    })
}
