// pgbackup/src/storage/retryable.rs
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Span, warn};

use super::{ObjectDescriptor, ObjectStorage, UploadBody};
use crate::errors::StorageError;
use crate::utils::retry::{RetryPolicy, retry};

/// Retries every operation of the wrapped backend under one policy.
///
/// Any backend error is retryable except cancellation. Uploads are the one
/// exception: once the body has been partly consumed it cannot be replayed, so
/// the failure is returned as is. Backends retry the pieces they have already
/// buffered themselves (see `send_buffered`).
pub struct RetryableStorage {
    inner: Arc<dyn ObjectStorage>,
    policy: RetryPolicy,
    span: Span,
}

impl RetryableStorage {
    pub fn new(inner: Arc<dyn ObjectStorage>, policy: RetryPolicy, span: Span) -> Self {
        Self {
            inner,
            policy,
            span,
        }
    }
}

fn retryable(error: &StorageError) -> bool {
    !matches!(error, StorageError::Cancelled)
}

/// Tracks how many bytes of an upload body the backend has pulled.
struct CountingReader<'a, 'c> {
    inner: UploadBody<'a>,
    consumed: &'c AtomicU64,
}

impl AsyncRead for CountingReader<'_, '_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        let read = (buf.filled().len() - before) as u64;
        this.consumed.fetch_add(read, Ordering::Relaxed);
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ObjectStorage for RetryableStorage {
    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        body: UploadBody<'_>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let consumed = &AtomicU64::new(0);
        let body = &Mutex::new(CountingReader {
            inner: body,
            consumed,
        });
        let inner = &self.inner;
        let span = &self.span;

        let rewindable = move |error: &StorageError| {
            if !retryable(error) {
                return false;
            }
            let read = consumed.load(Ordering::Relaxed);
            if read > 0 {
                span.in_scope(|| {
                    warn!(key, bytes_read = read, error = %error, "Upload failed mid-stream, not retrying")
                });
                return false;
            }
            true
        };

        retry(&self.policy, cancel, span, "upload", rewindable, move || async move {
            let mut reader = body.lock().await;
            inner.upload(cancel, key, &mut *reader, metadata).await
        })
        .await
        .map_err(StorageError::from)
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<(), StorageError> {
        let inner = &self.inner;
        retry(&self.policy, cancel, &self.span, "delete", retryable, move || async move {
            inner.delete(cancel, key).await
        })
        .await
        .map_err(StorageError::from)
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<ObjectDescriptor>, StorageError> {
        let inner = &self.inner;
        retry(&self.policy, cancel, &self.span, "list", retryable, move || async move {
            inner.list(cancel, prefix).await
        })
        .await
        .map_err(StorageError::from)
    }

    async fn metadata(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        let inner = &self.inner;
        retry(&self.policy, cancel, &self.span, "metadata", retryable, move || async move {
            inner.metadata(cancel, key).await
        })
        .await
        .map_err(StorageError::from)
    }

    async fn last_backup_time(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let inner = &self.inner;
        retry(
            &self.policy,
            cancel,
            &self.span,
            "last backup time",
            retryable,
            move || async move { inner.last_backup_time(cancel).await },
        )
        .await
        .map_err(StorageError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::super::memory::MemoryStorage;
    use super::*;
    use crate::errors::RetryError;
    use std::time::Duration;

    fn wrap(storage: &Arc<MemoryStorage>) -> RetryableStorage {
        RetryableStorage::new(
            storage.clone(),
            RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10), 2.0),
            Span::none(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_recovers_from_transient_failures() -> anyhow::Result<()> {
        let memory = Arc::new(MemoryStorage::new());
        memory.insert("a.tar.gz", Utc::now(), HashMap::new());
        memory.fail(|f| f.list = 2);

        let listed = wrap(&memory).list(&CancellationToken::new(), "").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(memory.calls("list"), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_exhaustion_reports_every_attempt() {
        let memory = Arc::new(MemoryStorage::new());
        memory.fail(|f| f.list = 10);

        let err = wrap(&memory)
            .list(&CancellationToken::new(), "")
            .await
            .unwrap_err();
        assert!(matches!(&err, StorageError::Retry(inner) if matches!(**inner, RetryError::Exhausted { attempts: 3, .. })));
        assert!(err.to_string().contains("attempt 3: list failed: connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_retried_while_body_untouched() -> anyhow::Result<()> {
        let memory = Arc::new(MemoryStorage::new());
        memory.fail(|f| f.upload = 1);

        let mut body: &[u8] = b"compressed archive";
        wrap(&memory)
            .upload(&CancellationToken::new(), "k", &mut body, &HashMap::new())
            .await?;
        assert_eq!(memory.calls("upload"), 2);
        assert_eq!(memory.object("k").map(|o| o.data), Some(b"compressed archive".to_vec()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_upload_is_retried_by_the_backend() -> anyhow::Result<()> {
        let memory = Arc::new(MemoryStorage::new());
        memory.fail(|f| f.commit = 1);

        let mut body: &[u8] = b"compressed archive";
        wrap(&memory)
            .upload(&CancellationToken::new(), "k", &mut body, &HashMap::new())
            .await?;
        // One pass over the stream, two sends of the buffered bytes.
        assert_eq!(memory.calls("upload"), 1);
        assert_eq!(memory.calls("commit"), 2);
        assert_eq!(memory.object("k").map(|o| o.data), Some(b"compressed archive".to_vec()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_not_retried_after_partial_read() {
        let memory = Arc::new(MemoryStorage::new());
        memory.fail(|f| f.upload_mid_stream = true);

        let mut body: &[u8] = b"compressed archive";
        let err = wrap(&memory)
            .upload(&CancellationToken::new(), "k", &mut body, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend { operation: "upload", .. }));
        assert_eq!(memory.calls("upload"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_backup_time_is_retried_as_a_whole() -> anyhow::Result<()> {
        let memory = Arc::new(MemoryStorage::new());
        let modified = Utc::now();
        memory.insert("a.tar.gz", modified, HashMap::new());
        memory.fail(|f| f.list = 1);

        let found = wrap(&memory).last_backup_time(&CancellationToken::new()).await?;
        assert_eq!(found, Some(modified));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_reported_as_cancellation() {
        let memory = Arc::new(MemoryStorage::new());
        memory.fail(|f| f.list = 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wrap(&memory).list(&cancel, "").await.unwrap_err();
        assert!(matches!(&err, StorageError::Retry(inner) if inner.is_cancelled()));
        assert_eq!(memory.calls("list"), 1);
    }
}
