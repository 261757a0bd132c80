// pgbackup/src/backup/pg_version.rs
use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use super::db_dump::run_client;
use crate::errors::{DumpError, RetryError};
use crate::utils::retry::{RetryPolicy, retry};

/// Client major versions shipped alongside this tool, as `pg_dumpNN`/`psqlNN`.
pub const PACKAGED_VERSIONS: [u32; 3] = [15, 16, 17];

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PostgreSQL (\d+)\.(\d+)").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub full: String,
}

impl ServerVersion {
    /// Parses the output of `SELECT version()`, e.g. `"PostgreSQL 16.2 on x86_64-pc-linux-gnu"`.
    pub fn parse(version: &str) -> Result<Self, DumpError> {
        let invalid = || DumpError::VersionParse(version.to_string());
        let captures = VERSION_PATTERN.captures(version).ok_or_else(invalid)?;
        let major: u32 = captures[1].parse().map_err(|_| invalid())?;
        let minor: u32 = captures[2].parse().map_err(|_| invalid())?;
        if major == 0 {
            return Err(invalid());
        }
        Ok(Self {
            major,
            minor,
            full: version.trim().to_string(),
        })
    }
}

/// Picks `<base><NN>` for the nearest packaged version at or above the server's
/// major (servers older than the oldest package use the oldest package), falling
/// back to the bare `base` name. `available` answers whether a name is installed.
pub fn select_binary(base: &str, server_major: u32, available: impl Fn(&str) -> bool) -> String {
    let floor = PACKAGED_VERSIONS.iter().copied().min().unwrap_or(server_major);
    let target = server_major.max(floor);

    let mut candidates: Vec<u32> = PACKAGED_VERSIONS
        .iter()
        .copied()
        .filter(|v| *v >= target)
        .collect();
    candidates.sort_unstable();

    candidates
        .into_iter()
        .map(|v| format!("{base}{v}"))
        .find(|name| available(name.as_str()))
        .unwrap_or_else(|| base.to_string())
}

/// Query client used before the server version is known: the newest packaged
/// `psqlNN` present, else plain `psql`.
pub fn initial_psql(available: impl Fn(&str) -> bool) -> String {
    let mut versions = PACKAGED_VERSIONS;
    versions.sort_unstable_by(|a, b| b.cmp(a));
    versions
        .iter()
        .map(|v| format!("psql{v}"))
        .find(|name| available(name.as_str()))
        .unwrap_or_else(|| "psql".to_string())
}

/// Asks the server for its version through `psql_bin`, retrying transient failures.
pub async fn detect_server_version(
    psql_bin: &str,
    connection_url: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    span: &Span,
) -> Result<ServerVersion, RetryError<DumpError>> {
    let args = [
        "--no-password",
        "--tuples-only",
        "--no-align",
        "--command",
        "SELECT version();",
        connection_url,
    ];
    let args = &args;
    retry(
        policy,
        cancel,
        span,
        "version query",
        DumpError::is_retryable,
        move || async move {
            let output = run_client(psql_bin, args, cancel).await?;
            ServerVersion::parse(output.trim())
        },
    )
    .await
}
