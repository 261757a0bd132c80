// pgbackup/src/storage/s3.rs
use std::collections::HashMap;
use std::future::Future;
use std::io;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use super::{ObjectDescriptor, ObjectStorage, UploadBody, join_key, send_buffered, strip_key_prefix};
use crate::config::S3Config;
use crate::errors::StorageError;
use crate::utils::retry::RetryPolicy;

/// Size of each multipart part; streams shorter than this go up in one `PutObject`.
pub const PART_SIZE: usize = 8 * 1024 * 1024;
const CONTENT_TYPE: &str = "application/gzip";

/// S3 (or S3-compatible) bucket, with every key rooted under `prefix`.
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    prefix: String,
    /// Retry policy for buffered parts.
    part_retry: RetryPolicy,
    span: Span,
}

impl S3Storage {
    pub async fn connect(
        config: &S3Config,
        prefix: String,
        part_retry: RetryPolicy,
        span: Span,
    ) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        // Custom endpoints (MinIO, Spaces, R2) want path-style addressing.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        span.in_scope(|| {
            info!(
                bucket = %config.bucket,
                region = %config.region,
                endpoint = config.endpoint.as_deref().unwrap_or("default"),
                prefix = %prefix,
                "Configured S3 storage"
            )
        });

        Ok(Self {
            client: s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix,
            part_retry,
            span,
        })
    }

    async fn upload_multipart(
        &self,
        cancel: &CancellationToken,
        full_key: &str,
        first_part: Vec<u8>,
        body: UploadBody<'_>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let created = cancellable(
            cancel,
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(full_key)
                .content_type(CONTENT_TYPE)
                .set_metadata(Some(metadata.clone()))
                .send(),
        )
        .await?
        .map_err(|e| StorageError::backend("create multipart upload", DisplayErrorContext(&e)))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::backend("create multipart upload", "no upload id returned"))?
            .to_string();

        let uploaded = self
            .upload_parts(cancel, full_key, &upload_id, first_part, body)
            .await;
        let parts = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart(full_key, &upload_id).await;
                return Err(e);
            }
        };

        let part_count = parts.len();
        let completed = cancellable(
            cancel,
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(full_key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send(),
        )
        .await
        .and_then(|sent| {
            sent.map_err(|e| {
                StorageError::backend("complete multipart upload", DisplayErrorContext(&e))
            })
        });
        if let Err(e) = completed {
            self.abort_multipart(full_key, &upload_id).await;
            return Err(e);
        }

        self.span.in_scope(|| {
            info!(key = %full_key, parts = part_count, "Multipart upload completed")
        });
        Ok(())
    }

    async fn upload_parts(
        &self,
        cancel: &CancellationToken,
        full_key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        body: UploadBody<'_>,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut chunk = first_part;

        loop {
            let chunk_len = chunk.len();
            let part = &Bytes::from(chunk);
            let (client, bucket) = (&self.client, &self.bucket);
            let output = send_buffered(&self.part_retry, cancel, &self.span, "upload part", move || async move {
                cancellable(
                    cancel,
                    client
                        .upload_part()
                        .bucket(bucket)
                        .key(full_key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(part.clone()))
                        .send(),
                )
                .await
                .and_then(|sent| {
                    sent.map_err(|e| StorageError::backend("upload part", DisplayErrorContext(&e)))
                })
            })
            .await?;

            self.span.in_scope(|| debug!(part_number, bytes = chunk_len, "Uploaded part"));
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .build(),
            );

            chunk = cancellable(cancel, read_part(&mut *body, PART_SIZE))
                .await?
                .map_err(StorageError::Body)?;
            if chunk.is_empty() {
                return Ok(parts);
            }
            part_number += 1;
        }
    }

    /// Best effort: an unreachable abort leaves the parts for a bucket lifecycle rule.
    async fn abort_multipart(&self, full_key: &str, upload_id: &str) {
        let aborted = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(full_key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = aborted {
            self.span.in_scope(|| {
                warn!(key = %full_key, error = %DisplayErrorContext(&e), "Failed to abort multipart upload")
            });
        }
    }
}

/// Reads up to `limit` bytes, stopping early only at end of stream.
async fn read_part(body: &mut (dyn AsyncRead + Send + Unpin), limit: usize) -> io::Result<Vec<u8>> {
    let mut part = Vec::with_capacity(limit.min(PART_SIZE));
    body.take(limit as u64).read_to_end(&mut part).await?;
    Ok(part)
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = T>,
) -> Result<T, StorageError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        output = operation => Ok(output),
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        body: UploadBody<'_>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let full_key = join_key(&self.prefix, key);
        let first_part = cancellable(cancel, read_part(&mut *body, PART_SIZE))
            .await?
            .map_err(StorageError::Body)?;

        if first_part.len() == PART_SIZE {
            return self
                .upload_multipart(cancel, &full_key, first_part, body, metadata)
                .await;
        }

        let size = first_part.len();
        let object = &Bytes::from(first_part);
        let (client, bucket, key) = (&self.client, &self.bucket, full_key.as_str());
        send_buffered(&self.part_retry, cancel, &self.span, "upload", move || async move {
            cancellable(
                cancel,
                client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .content_type(CONTENT_TYPE)
                    .set_metadata(Some(metadata.clone()))
                    .body(ByteStream::from(object.clone()))
                    .send(),
            )
            .await
            .and_then(|sent| sent.map_err(|e| StorageError::backend("upload", DisplayErrorContext(&e))))
        })
        .await?;

        self.span.in_scope(|| info!(key = %full_key, bytes = size, "Uploaded object"));
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<(), StorageError> {
        let full_key = join_key(&self.prefix, key);
        cancellable(
            cancel,
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .send(),
        )
        .await?
        .map_err(|e| StorageError::backend("delete", DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<ObjectDescriptor>, StorageError> {
        let full_prefix = join_key(&self.prefix, prefix);
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = cancellable(
                cancel,
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&full_prefix)
                    .set_continuation_token(continuation.take())
                    .send(),
            )
            .await?
            .map_err(|e| StorageError::backend("list", DisplayErrorContext(&e)))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                objects.push(ObjectDescriptor {
                    key: strip_key_prefix(&self.prefix, key).to_string(),
                    size: object.size().unwrap_or(0),
                    last_modified,
                    // Listing does not return user metadata; see `metadata`.
                    metadata: HashMap::new(),
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn metadata(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        let full_key = join_key(&self.prefix, key);
        let head = cancellable(
            cancel,
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .send(),
        )
        .await?
        .map_err(|e| StorageError::backend("head object", DisplayErrorContext(&e)))?;
        Ok(head.metadata().cloned().unwrap_or_default())
    }
}
