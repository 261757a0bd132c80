use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Failures of the dump tooling: `pg_dump`/`psql` invocations and the archive they produce.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("{binary} exited with {status}: {stderr}")]
    Command {
        binary: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("unexpected output from {binary}: {output}")]
    UnexpectedOutput { binary: String, output: String },

    #[error("could not parse PostgreSQL version from: {0}")]
    VersionParse(String),

    #[error("failed to compress backup: {0}")]
    Compression(#[source] io::Error),

    #[error("backup archive is empty")]
    EmptyBackup,

    #[error("invalid gzip format: {0}")]
    InvalidGzip(#[source] io::Error),

    #[error("invalid tar format: {0}")]
    InvalidTar(#[source] io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

/// Lowercase substrings that mark a failure as transient: cold boot, refused or
/// unreachable server, DNS trouble and timeouts.
const RETRYABLE_MARKERS: &[&str] = &[
    "starting up",
    "57p03",
    "connection refused",
    "could not connect",
    "no such host",
    "could not translate host name",
    "timeout",
    "timed out",
];

/// Classifies an error message plus captured diagnostic output, ignoring case.
pub fn is_retryable_message(message: &str) -> bool {
    let message = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker))
}

impl DumpError {
    /// Whether retrying the same invocation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DumpError::Command { stderr, .. } => is_retryable_message(stderr),
            DumpError::Spawn { source, .. } => is_retryable_message(&source.to_string()),
            _ => false,
        }
    }
}

/// Failures reported by object storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("failed to read upload body: {0}")]
    Body(#[source] io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Retry(Box<RetryError<StorageError>>),
}

impl From<RetryError<StorageError>> for StorageError {
    fn from(error: RetryError<StorageError>) -> Self {
        match error {
            RetryError::NonRetryable(inner) => inner,
            other => StorageError::Retry(Box::new(other)),
        }
    }
}

impl StorageError {
    pub fn backend(operation: &'static str, message: impl ToString) -> Self {
        StorageError::Backend {
            operation,
            message: message.to_string(),
        }
    }
}

/// Aggregate outcome of a retried operation that did not succeed.
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("cancelled after {attempts} attempt(s){}", render_causes(.errors))]
    Cancelled { attempts: u32, errors: Vec<E> },

    #[error("non-retryable error: {0}")]
    NonRetryable(#[source] E),

    #[error("failed after {attempts} attempt(s){}", render_causes(.errors))]
    Exhausted { attempts: u32, errors: Vec<E> },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// The most recent underlying failure, if any attempt ran.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::NonRetryable(error) => Some(error),
            RetryError::Cancelled { errors, .. } | RetryError::Exhausted { errors, .. } => {
                errors.last()
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

fn render_causes<E: std::fmt::Display>(errors: &[E]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let causes: Vec<String> = errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("attempt {}: {}", i + 1, e))
        .collect();
    format!(" ({})", causes.join("; "))
}

/// Failures decoding a backup object key.
#[derive(Error, Debug, PartialEq)]
pub enum FilenameError {
    #[error("filename too short to contain timestamp: {0}")]
    TooShort(String),

    #[error("invalid timestamp segment: {0}")]
    InvalidFormat(String),

    #[error("invalid timestamp {segment}: {source}")]
    InvalidTimestamp {
        segment: String,
        #[source]
        source: chrono::ParseError,
    },
}
