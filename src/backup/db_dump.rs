// pgbackup/src/backup/db_dump.rs
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use super::archive::{compress_into, validate_stream};
use super::pg_version::{ServerVersion, initial_psql, detect_server_version, select_binary};
use crate::errors::{DumpError, RetryError};
use crate::utils::pipe::{DEFAULT_PIPE_DEPTH, PipeWriter, pipe};
use crate::utils::retry::{RetryPolicy, retry};
use crate::utils::{binary_on_path, redact_url};

const PG_DUMP: &str = "pg_dump";
const PSQL: &str = "psql";
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const STDERR_TAIL_LIMIT: usize = 64 * 1024;
const INFO_QUERY: &str =
    "SELECT current_database(), pg_database_size(current_database()), version();";
const UNKNOWN: &str = "unknown";

/// Compressed archive produced by a dump. Dropping it before the end stops the dump.
pub type BackupStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub size: i64,
    pub version: String,
}

impl DatabaseInfo {
    /// Stand-in used when the database could not be queried.
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            size: 0,
            version: UNKNOWN.to_string(),
        }
    }
}

#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    /// Starts a dump and returns its gzip-compressed tar archive as a stream.
    async fn dump(&self, cancel: &CancellationToken) -> Result<BackupStream, DumpError>;

    /// Checks that `stream` is a non-empty gzip-compressed tar archive.
    async fn validate(
        &self,
        cancel: &CancellationToken,
        stream: BackupStream,
    ) -> Result<(), DumpError>;

    async fn get_info(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DatabaseInfo, RetryError<DumpError>>;
}

/// Runs a client binary to completion and returns its standard output.
pub(crate) async fn run_client(
    binary: &str,
    args: &[&str],
    cancel: &CancellationToken,
) -> Result<String, DumpError> {
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DumpError::Spawn {
            binary: binary.to_string(),
            source,
        })?;

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(DumpError::Cancelled),
        output = child.wait_with_output() => output.map_err(|source| DumpError::Spawn {
            binary: binary.to_string(),
            source,
        })?,
    };

    if !output.status.success() {
        return Err(DumpError::Command {
            binary: binary.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `pg_dump`/`psql` based dumper for a single PostgreSQL database.
pub struct PostgresDumper {
    connection_url: String,
    pg_dump_options: Vec<String>,
    pg_dump_bin: String,
    psql_bin: String,
    query_policy: RetryPolicy,
    span: Span,
}

impl PostgresDumper {
    /// Detects the server version and picks matching client binaries. A failed
    /// detection is logged and the generic binaries are used instead.
    pub async fn new(
        connection_url: impl Into<String>,
        pg_dump_options: &str,
        query_policy: RetryPolicy,
        cancel: &CancellationToken,
        span: Span,
    ) -> Self {
        let psql = initial_psql(binary_on_path);
        let mut dumper = Self::with_binaries(
            connection_url,
            pg_dump_options,
            PG_DUMP,
            psql,
            query_policy,
            span,
        );

        let detected = tokio::time::timeout(
            DETECT_TIMEOUT,
            detect_server_version(
                &dumper.psql_bin,
                &dumper.connection_url,
                &dumper.query_policy,
                cancel,
                &dumper.span,
            ),
        )
        .await;

        match detected {
            Ok(Ok(version)) => dumper.adopt_server_version(&version, binary_on_path),
            Ok(Err(e)) => dumper.span.in_scope(|| {
                warn!(error = %e, "Could not detect PostgreSQL version, using default binaries")
            }),
            Err(_) => dumper.span.in_scope(|| {
                warn!(
                    timeout_secs = DETECT_TIMEOUT.as_secs(),
                    "PostgreSQL version detection timed out, using default binaries"
                )
            }),
        }
        dumper
    }

    /// Builds a dumper around explicit binaries without probing the server.
    pub fn with_binaries(
        connection_url: impl Into<String>,
        pg_dump_options: &str,
        pg_dump_bin: impl Into<String>,
        psql_bin: impl Into<String>,
        query_policy: RetryPolicy,
        span: Span,
    ) -> Self {
        Self {
            connection_url: connection_url.into(),
            pg_dump_options: pg_dump_options.split_whitespace().map(str::to_string).collect(),
            pg_dump_bin: pg_dump_bin.into(),
            psql_bin: psql_bin.into(),
            query_policy,
            span,
        }
    }

    fn adopt_server_version(&mut self, version: &ServerVersion, available: impl Fn(&str) -> bool) {
        self.pg_dump_bin = select_binary(PG_DUMP, version.major, &available);
        self.psql_bin = select_binary(PSQL, version.major, &available);
        self.span.in_scope(|| {
            info!(
                version = %version.full,
                major = version.major,
                pg_dump = %self.pg_dump_bin,
                psql = %self.psql_bin,
                "Detected PostgreSQL version"
            )
        });
    }

    fn dump_args(&self) -> Vec<&str> {
        let mut args = vec!["--format=tar", "--verbose", "--no-password"];
        args.extend(self.pg_dump_options.iter().map(String::as_str));
        args.push(&self.connection_url);
        args
    }
}

#[async_trait]
impl DatabaseDumper for PostgresDumper {
    async fn dump(&self, cancel: &CancellationToken) -> Result<BackupStream, DumpError> {
        let spawn_error = |source| DumpError::Spawn {
            binary: self.pg_dump_bin.clone(),
            source,
        };
        let mut child = Command::new(&self.pg_dump_bin)
            .args(self.dump_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(&spawn_error)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stderr was not captured")))?;

        self.span.in_scope(|| {
            info!(
                binary = %self.pg_dump_bin,
                target = %redact_url(&self.connection_url),
                "Started pg_dump"
            )
        });

        let (writer, reader) = pipe(DEFAULT_PIPE_DEPTH);
        tokio::spawn(drive_dump(
            self.pg_dump_bin.clone(),
            child,
            stdout,
            stderr,
            writer,
            cancel.clone(),
            self.span.clone(),
        ));
        Ok(Box::new(reader))
    }

    async fn validate(
        &self,
        cancel: &CancellationToken,
        stream: BackupStream,
    ) -> Result<(), DumpError> {
        validate_stream(stream, cancel).await
    }

    async fn get_info(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DatabaseInfo, RetryError<DumpError>> {
        let psql = self.psql_bin.as_str();
        let args = [
            "--no-password",
            "--tuples-only",
            "--no-align",
            "--field-separator=|",
            "--command",
            INFO_QUERY,
            self.connection_url.as_str(),
        ];
        let args = &args;
        retry(
            &self.query_policy,
            cancel,
            &self.span,
            "database info query",
            DumpError::is_retryable,
            move || async move {
                let output = run_client(psql, args, cancel).await?;
                parse_info(psql, &output)
            },
        )
        .await
    }
}

/// Parses one `name|size|version` row. A non-numeric size reads as 0.
fn parse_info(binary: &str, output: &str) -> Result<DatabaseInfo, DumpError> {
    let parts: Vec<&str> = output.trim().split('|').collect();
    let [name, size, version] = parts.as_slice() else {
        return Err(DumpError::UnexpectedOutput {
            binary: binary.to_string(),
            output: output.trim().to_string(),
        });
    };
    Ok(DatabaseInfo {
        name: name.trim().to_string(),
        size: size.trim().parse().unwrap_or(0),
        version: version.trim().to_string(),
    })
}

/// Background half of a dump: stdout -> gzip -> pipe, then reaps the process and
/// closes the pipe with the first failure observed.
async fn drive_dump(
    binary: String,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    writer: PipeWriter,
    cancel: CancellationToken,
    span: Span,
) {
    let stderr_tail = tokio::spawn(read_tail(stderr, STDERR_TAIL_LIMIT));
    let copied = compress_into(stdout, &writer, &cancel).await;

    let status = match &copied {
        Ok(_) => wait_or_kill(&mut child, &binary, &cancel).await,
        Err(_) => {
            let _ = child.kill().await;
            Err(DumpError::Cancelled)
        }
    };
    let stderr = stderr_tail.await.unwrap_or_default();

    let outcome = match (copied, status) {
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        (Ok(_), Ok(status)) if !status.success() => Err(DumpError::Command {
            binary: binary.clone(),
            status,
            stderr,
        }),
        (Ok(bytes), Ok(_)) => Ok(bytes),
    };

    match outcome {
        Ok(bytes) => {
            span.in_scope(|| info!(binary = %binary, uncompressed_bytes = bytes, "pg_dump completed"));
            writer.close();
        }
        Err(e) => {
            span.in_scope(|| warn!(binary = %binary, error = %e, "pg_dump failed"));
            writer.close_with_error(io::Error::other(e)).await;
        }
    }
}

async fn wait_or_kill(
    child: &mut Child,
    binary: &str,
    cancel: &CancellationToken,
) -> Result<ExitStatus, DumpError> {
    let waited = tokio::select! {
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };
    match waited {
        Some(status) => status.map_err(|source| DumpError::Spawn {
            binary: binary.to_string(),
            source,
        }),
        None => {
            let _ = child.kill().await;
            Err(DumpError::Cancelled)
        }
    }
}

/// Drains `stderr` to EOF, keeping only its last `limit` bytes.
async fn read_tail(mut stderr: ChildStderr, limit: usize) -> String {
    let mut tail = Vec::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
            Err(e) => {
                debug!(error = %e, "Stopped reading pg_dump stderr");
                break;
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}
