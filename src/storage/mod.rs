// pgbackup/src/storage/mod.rs
//! Object storage capability and its backends.

#[cfg(feature = "gcs")]
pub mod gcs;
#[cfg(test)]
pub(crate) mod memory;
pub mod retryable;
pub mod s3;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::config::{AppConfig, StorageConfig};
use crate::errors::StorageError;
use crate::utils::retry::{RetryPolicy, retry};

pub use retryable::RetryableStorage;

/// Metadata key carrying the application-side creation time (RFC 3339).
pub const METADATA_TIMESTAMP: &str = "backup-timestamp";

/// A stored object as reported by a listing. Keys are relative to the backend's prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescriptor {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

pub type UploadBody<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores everything `body` yields under `key`, tagged with `metadata`.
    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        body: UploadBody<'_>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError>;

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<(), StorageError>;

    async fn list(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<ObjectDescriptor>, StorageError>;

    /// User metadata of a single object.
    async fn metadata(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError>;

    /// Creation time of the newest backup, or `None` when nothing is stored.
    ///
    /// Takes the most recently modified object and prefers its
    /// `backup-timestamp` metadata over the storage modification time.
    async fn last_backup_time(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let objects = self.list(cancel, "").await?;
        let Some(latest) = objects.into_iter().max_by_key(|o| o.last_modified) else {
            return Ok(None);
        };

        let stamped = match self.metadata(cancel, &latest.key).await {
            Ok(metadata) => metadata
                .get(METADATA_TIMESTAMP)
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|t| t.with_timezone(&Utc)),
            Err(StorageError::Cancelled) => return Err(StorageError::Cancelled),
            Err(_) => None,
        };
        Ok(Some(stamped.unwrap_or(latest.last_modified)))
    }
}

/// Sends one piece of an upload whose bytes are already buffered: a small
/// object, a multipart part or a resumable chunk. Backend failures are retried
/// here, since the piece can be replayed even though the stream cannot.
pub(crate) async fn send_buffered<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    span: &Span,
    operation: &str,
    send: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let transient = |error: &StorageError| matches!(error, StorageError::Backend { .. });
    retry(policy, cancel, span, operation, transient, send)
        .await
        .map_err(StorageError::from)
}

/// Joins a backend prefix and a relative key with exactly one `/`.
pub(crate) fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (false, true) => format!("{prefix}/"),
        (false, false) => format!("{prefix}/{key}"),
    }
}

/// Inverse of [`join_key`] for keys returned by a listing.
pub(crate) fn strip_key_prefix<'a>(prefix: &str, full_key: &'a str) -> &'a str {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return full_key;
    }
    full_key
        .strip_prefix(prefix)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(full_key)
}

/// Builds the configured backend, rooted at the backup prefix and wrapped in retries.
pub async fn create_storage(
    config: &AppConfig,
    span: &Span,
) -> anyhow::Result<Arc<dyn ObjectStorage>> {
    let prefix = config.backup.file_prefix.clone();
    let backend: Arc<dyn ObjectStorage> = match &config.storage {
        StorageConfig::S3(s3_config) => Arc::new(
            s3::S3Storage::connect(s3_config, prefix, RetryPolicy::storage_default(), span.clone())
                .await?,
        ),
        #[cfg(feature = "gcs")]
        StorageConfig::Gcs(gcs_config) => Arc::new(
            gcs::GcsStorage::connect(gcs_config, prefix, RetryPolicy::storage_default(), span.clone())
                .await?,
        ),
        #[cfg(not(feature = "gcs"))]
        StorageConfig::Gcs(_) => anyhow::bail!(
            "storage provider 'gcs' requires pgbackup to be built with the `gcs` feature"
        ),
    };

    Ok(Arc::new(RetryableStorage::new(
        backend,
        RetryPolicy::storage_default(),
        span.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStorage;
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_join_and_strip_prefix() {
        assert_eq!(join_key("backup", "2024/01/a.tar.gz"), "backup/2024/01/a.tar.gz");
        assert_eq!(join_key("backup/", "/x"), "backup/x");
        assert_eq!(join_key("backup", ""), "backup/");
        assert_eq!(join_key("", "x"), "x");
        assert_eq!(strip_key_prefix("backup", "backup/2024/01/a"), "2024/01/a");
        assert_eq!(strip_key_prefix("", "2024/01/a"), "2024/01/a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_buffered_retries_backend_failures() -> anyhow::Result<()> {
        let attempts = &std::sync::atomic::AtomicU32::new(0);
        let sent = send_buffered(
            &RetryPolicy::storage_default(),
            &CancellationToken::new(),
            &Span::none(),
            "upload part",
            move || async move {
                match attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                    0 => Err(StorageError::backend("upload part", "503 SlowDown")),
                    _ => Ok("etag-1"),
                }
            },
        )
        .await?;
        assert_eq!(sent, "etag-1");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_buffered_gives_up_on_body_errors() {
        let attempts = &std::sync::atomic::AtomicU32::new(0);
        let err = send_buffered(
            &RetryPolicy::storage_default(),
            &CancellationToken::new(),
            &Span::none(),
            "upload part",
            move || async move {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err::<(), _>(StorageError::Body(std::io::Error::other("pg_dump exited with status 1")))
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Body(_)));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_backup_time_empty_storage() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        assert_eq!(storage.last_backup_time(&CancellationToken::new()).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_last_backup_time_prefers_metadata_of_newest() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let stamped = now - TimeDelta::hours(3);
        storage.insert("old.tar.gz", now - TimeDelta::days(2), HashMap::new());
        storage.insert(
            "new.tar.gz",
            now,
            HashMap::from([(METADATA_TIMESTAMP.to_string(), stamped.to_rfc3339())]),
        );
        let found = storage.last_backup_time(&CancellationToken::new()).await?;
        assert_eq!(found, Some(stamped));
        Ok(())
    }

    #[tokio::test]
    async fn test_last_backup_time_falls_back_to_last_modified() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let modified = Utc::now() - TimeDelta::hours(1);
        storage.insert(
            "new.tar.gz",
            modified,
            HashMap::from([(METADATA_TIMESTAMP.to_string(), "yesterday".to_string())]),
        );
        let found = storage.last_backup_time(&CancellationToken::new()).await?;
        assert_eq!(found, Some(modified));
        Ok(())
    }
}
