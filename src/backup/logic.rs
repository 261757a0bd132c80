// pgbackup/src/backup/logic.rs
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use super::db_dump::{BackupStream, DatabaseDumper, DatabaseInfo};
use super::rate_limit::RateLimiter;
use crate::storage::{METADATA_TIMESTAMP, ObjectStorage};
use crate::utils::filename::{generate_backup_filename, parse_backup_filename, storage_key};
use crate::utils::pipe::{DEFAULT_PIPE_DEPTH, PipeWriter, pipe};

pub const TOOL_NAME: &str = "pgbackup";
pub const METADATA_DATABASE_NAME: &str = "database-name";
pub const METADATA_DATABASE_VERSION: &str = "database-version";
pub const METADATA_TOOL: &str = "backup-tool";

const COPY_CHUNK: usize = 64 * 1024;

/// Result of a successful run. A skipped run is not a failure.
#[derive(Debug)]
pub enum RunOutcome {
    Skipped { reason: String },
    Completed(BackupRun),
}

#[derive(Debug)]
pub struct BackupRun {
    pub timestamp: DateTime<Utc>,
    /// Storage key relative to the backup prefix.
    pub key: String,
    /// Compressed bytes handed to storage.
    pub bytes: u64,
    pub info: DatabaseInfo,
    /// `None` when retention is disabled or the sweep itself failed.
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    pub retained: usize,
}

/// Drives one backup: respawn check, dump, upload and retention sweep.
pub struct Orchestrator {
    storage: Arc<dyn ObjectStorage>,
    dumper: Arc<dyn DatabaseDumper>,
    rate_limiter: RateLimiter,
    file_prefix: String,
    retention_days: u32,
    span: Span,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        dumper: Arc<dyn DatabaseDumper>,
        rate_limiter: RateLimiter,
        file_prefix: impl Into<String>,
        retention_days: u32,
        span: Span,
    ) -> Self {
        Self {
            storage,
            dumper,
            rate_limiter,
            file_prefix: file_prefix.into(),
            retention_days,
            span,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        ensure_active(cancel)?;

        // Missing respawn information never blocks a backup.
        let last_backup = match self.storage.last_backup_time(cancel).await {
            Ok(last) => last,
            Err(e) => {
                ensure_active(cancel)?;
                self.span.in_scope(|| {
                    warn!(error = %e, "Could not determine last backup time, proceeding")
                });
                None
            }
        };

        let decision = self.rate_limiter.should_backup(last_backup);
        if !decision.proceed {
            self.span.in_scope(|| {
                info!(
                    reason = %decision.reason,
                    min_interval_secs = self.rate_limiter.min_interval().as_secs(),
                    "Skipping backup"
                )
            });
            return Ok(RunOutcome::Skipped {
                reason: decision.reason,
            });
        }
        self.span
            .in_scope(|| info!(reason = %decision.reason, "Starting backup"));

        let info = match self.dumper.get_info(cancel).await {
            Ok(info) => info,
            Err(e) if e.is_cancelled() => bail!("backup run cancelled while querying database info"),
            Err(e) => {
                ensure_active(cancel)?;
                let cause = e.last_error().map(ToString::to_string).unwrap_or_default();
                self.span.in_scope(|| {
                    warn!(error = %e, %cause, "Could not query database info, continuing")
                });
                DatabaseInfo::unknown()
            }
        };
        self.span.in_scope(|| {
            info!(database = %info.name, size_bytes = info.size, version = %info.version, "Database info")
        });

        let timestamp = Utc::now().trunc_subsecs(3);
        let filename = generate_backup_filename(&self.file_prefix, timestamp, &info.version);
        let key = storage_key(timestamp, &filename);
        let metadata = backup_metadata(timestamp, &info);

        let stream = self
            .dumper
            .dump(cancel)
            .await
            .context("failed to start database dump")?;
        let bytes = self.stream_to_storage(cancel, stream, &key, &metadata).await?;
        self.span
            .in_scope(|| info!(key = %key, bytes, "Backup uploaded"));

        let cleanup = if self.retention_days > 0 {
            match self.cleanup_old_backups(cancel).await {
                Ok(report) => Some(report),
                Err(e) => {
                    self.span
                        .in_scope(|| warn!(error = format!("{e:#}"), "Cleanup of old backups failed"));
                    None
                }
            }
        } else {
            None
        };

        Ok(RunOutcome::Completed(BackupRun {
            timestamp,
            key,
            bytes,
            info,
            cleanup,
        }))
    }

    /// Feeds the dump through a counting stage into the upload, both running at
    /// once over a bounded pipe.
    async fn stream_to_storage(
        &self,
        cancel: &CancellationToken,
        stream: BackupStream,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<u64> {
        let (writer, reader) = pipe(DEFAULT_PIPE_DEPTH);
        let storage = &self.storage;
        // The reader is dropped with the upload, which stops the copy if the upload gives up.
        let upload = async move {
            let mut reader = reader;
            storage.upload(cancel, key, &mut reader, metadata).await
        };

        let (copied, uploaded) = tokio::join!(count_into(stream, writer, cancel), upload);
        uploaded.with_context(|| format!("failed to upload backup {key}"))?;
        copied.context("backup stream failed")
    }

    /// Deletes every backup older than the retention period. A period reaching
    /// past the earliest representable time expires nothing.
    pub async fn cleanup_old_backups(&self, cancel: &CancellationToken) -> Result<CleanupReport> {
        let cutoff = TimeDelta::try_days(i64::from(self.retention_days))
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            self.span.in_scope(|| {
                warn!(retention_days = self.retention_days, "Retention period out of range, nothing expires")
            });
            return Ok(CleanupReport::default());
        };
        self.cleanup_before(cancel, cutoff).await
    }

    async fn cleanup_before(
        &self,
        cancel: &CancellationToken,
        cutoff: DateTime<Utc>,
    ) -> Result<CleanupReport> {
        let objects = self
            .storage
            .list(cancel, "")
            .await
            .context("failed to list backups for cleanup")?;

        let mut report = CleanupReport::default();
        for object in objects {
            let created = match parse_backup_filename(&object.key) {
                Ok(created) => created,
                Err(e) => {
                    self.span.in_scope(|| {
                        debug!(key = %object.key, error = %e, "Using last-modified time as backup age")
                    });
                    object.last_modified
                }
            };
            if created >= cutoff {
                report.retained += 1;
                continue;
            }

            match self.storage.delete(cancel, &object.key).await {
                Ok(()) => {
                    self.span
                        .in_scope(|| info!(key = %object.key, created = %created, "Deleted expired backup"));
                    report.deleted.push(object.key);
                }
                Err(e) => {
                    ensure_active(cancel)?;
                    self.span
                        .in_scope(|| warn!(key = %object.key, error = %e, "Failed to delete expired backup"));
                    report.failed.push(object.key);
                }
            }
        }

        self.span.in_scope(|| {
            info!(
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                retained = report.retained,
                "Cleanup finished"
            )
        });
        Ok(report)
    }
}

fn backup_metadata(timestamp: DateTime<Utc>, info: &DatabaseInfo) -> HashMap<String, String> {
    HashMap::from([
        (
            METADATA_TIMESTAMP.to_string(),
            timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        (METADATA_DATABASE_NAME.to_string(), info.name.clone()),
        (METADATA_DATABASE_VERSION.to_string(), info.version.clone()),
        (METADATA_TOOL.to_string(), TOOL_NAME.to_string()),
    ])
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        bail!("backup run cancelled");
    }
    Ok(())
}

/// Copies `source` into `sink`, counting bytes. A read failure is handed on to
/// the consumer so the upload fails with the dump's own error.
async fn count_into(
    mut source: BackupStream,
    sink: PipeWriter,
    cancel: &CancellationToken,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "backup run cancelled")),
            read = source.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                sink.close();
                return Ok(total);
            }
            Ok(n) => {
                sink.write(Bytes::copy_from_slice(&buf[..n])).await?;
                total += n as u64;
            }
            Err(e) => {
                let summary = io::Error::new(e.kind(), e.to_string());
                sink.close_with_error(e).await;
                return Err(summary);
            }
        }
    }
}
