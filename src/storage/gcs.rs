// pgbackup/src/storage/gcs.rs
use std::collections::HashMap;

use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::Object;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};
use google_cloud_storage::http::resumable_upload_client::{ChunkSize, UploadStatus};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, warn};

use super::{ObjectDescriptor, ObjectStorage, UploadBody, join_key, send_buffered, strip_key_prefix};
use crate::config::GcsConfig;
use crate::errors::StorageError;
use crate::utils::retry::RetryPolicy;

/// Resumable upload chunk; must stay a multiple of 256 KiB.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;
const CONTENT_TYPE: &str = "application/gzip";

pub struct GcsStorage {
    client: Client,
    bucket: String,
    prefix: String,
    chunk_retry: RetryPolicy,
    span: Span,
}

/// Rejects anything that is not a service account key file.
pub fn validate_service_account_json(json: &str) -> anyhow::Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("invalid service account JSON")?;
    match value.get("type").and_then(|t| t.as_str()) {
        Some("service_account") => Ok(()),
        other => bail!("invalid service account type: {}", other.unwrap_or("<missing>")),
    }
}

impl GcsStorage {
    pub async fn connect(
        config: &GcsConfig,
        prefix: String,
        chunk_retry: RetryPolicy,
        span: Span,
    ) -> anyhow::Result<Self> {
        validate_service_account_json(&config.service_account_json)?;
        let credentials: CredentialsFile = serde_json::from_str(&config.service_account_json)
            .context("failed to parse service account credentials")?;
        let mut client_config = ClientConfig::default()
            .with_credentials(credentials)
            .await
            .context("failed to load GCS credentials")?;
        client_config.project_id = Some(config.project_id.clone());

        span.in_scope(|| {
            info!(bucket = %config.bucket, project = %config.project_id, prefix = %prefix, "Configured GCS storage")
        });

        Ok(Self {
            client: Client::new(client_config),
            bucket: config.bucket.clone(),
            prefix,
            chunk_retry,
            span,
        })
    }

    fn object_request(&self) -> UploadObjectRequest {
        UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        }
    }

    async fn upload_resumable(
        &self,
        cancel: &CancellationToken,
        object: Object,
        first_chunk: Vec<u8>,
        body: UploadBody<'_>,
    ) -> Result<(), StorageError> {
        let name = object.name.clone();
        let uploader = self
            .client
            .prepare_resumable_upload(&self.object_request(), &UploadType::Multipart(Box::new(object)))
            .await
            .map_err(|e| StorageError::backend("prepare resumable upload", e))?;

        let mut offset: u64 = 0;
        let mut current = first_chunk;
        loop {
            let next = read_chunk(cancel, &mut *body).await?;
            let len = current.len() as u64;
            let total = next.is_empty().then_some(offset + len);
            let size = &ChunkSize::new(offset, offset + len - 1, total);
            let chunk = &Bytes::from(current);
            let uploader_ref = &uploader;

            let sent = send_buffered(&self.chunk_retry, cancel, &self.span, "upload chunk", move || async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(StorageError::Cancelled),
                    status = uploader_ref.upload_multiple_chunk(chunk.clone(), size) => {
                        status.map_err(|e| StorageError::backend("upload chunk", e))
                    }
                }
            })
            .await;
            let status = match sent {
                Ok(status) => status,
                Err(e) => {
                    if let Err(cancel_err) = uploader.cancel().await {
                        self.span.in_scope(|| {
                            warn!(object = %name, error = %cancel_err, "Failed to cancel resumable upload")
                        });
                    }
                    return Err(e);
                }
            };

            offset += len;
            if total.is_some() {
                return match status {
                    UploadStatus::Ok(_) => {
                        self.span.in_scope(|| info!(object = %name, bytes = offset, "Uploaded object"));
                        Ok(())
                    }
                    _ => Err(StorageError::backend(
                        "upload",
                        "resumable upload did not finalize after the last chunk",
                    )),
                };
            }
            current = next;
        }
    }
}

async fn read_chunk(
    cancel: &CancellationToken,
    body: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<Vec<u8>, StorageError> {
    let mut chunk = Vec::with_capacity(CHUNK_SIZE);
    tokio::select! {
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        read = body.take(CHUNK_SIZE as u64).read_to_end(&mut chunk) => {
            read.map_err(StorageError::Body)?;
            Ok(chunk)
        }
    }
}

fn to_descriptor(prefix: &str, object: Object) -> ObjectDescriptor {
    let last_modified = object
        .updated
        .and_then(|t| DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    ObjectDescriptor {
        key: strip_key_prefix(prefix, &object.name).to_string(),
        size: object.size,
        last_modified,
        metadata: object.metadata.unwrap_or_default(),
    }
}

#[async_trait]
impl ObjectStorage for GcsStorage {
    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        body: UploadBody<'_>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let object = Object {
            name: join_key(&self.prefix, key),
            content_type: Some(CONTENT_TYPE.to_string()),
            metadata: Some(metadata.clone()),
            ..Default::default()
        };

        let first_chunk = read_chunk(cancel, &mut *body).await?;
        if first_chunk.len() == CHUNK_SIZE {
            return self.upload_resumable(cancel, object, first_chunk, body).await;
        }

        let name = object.name.clone();
        let size = first_chunk.len();
        let data = &Bytes::from(first_chunk);
        let request = &self.object_request();
        let upload_type = &UploadType::Multipart(Box::new(object));
        let client = &self.client;
        send_buffered(&self.chunk_retry, cancel, &self.span, "upload", move || async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(StorageError::Cancelled),
                uploaded = client.upload_object(request, data.clone(), upload_type) => {
                    uploaded.map_err(|e| StorageError::backend("upload", e))
                }
            }
        })
        .await?;
        self.span.in_scope(|| info!(object = %name, bytes = size, "Uploaded object"));
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<(), StorageError> {
        let request = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: join_key(&self.prefix, key),
            ..Default::default()
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            deleted = self.client.delete_object(&request) => {
                deleted.map_err(|e| StorageError::backend("delete", e))
            }
        }
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<ObjectDescriptor>, StorageError> {
        let mut request = ListObjectsRequest {
            bucket: self.bucket.clone(),
            prefix: Some(join_key(&self.prefix, prefix)),
            ..Default::default()
        };
        let mut objects = Vec::new();

        loop {
            let page = tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                page = self.client.list_objects(&request) => {
                    page.map_err(|e| StorageError::backend("list", e))?
                }
            };
            objects.extend(
                page.items
                    .unwrap_or_default()
                    .into_iter()
                    .map(|object| to_descriptor(&self.prefix, object)),
            );
            match page.next_page_token {
                Some(token) if !token.is_empty() => request.page_token = Some(token),
                _ => return Ok(objects),
            }
        }
    }

    async fn metadata(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: join_key(&self.prefix, key),
            ..Default::default()
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            object = self.client.get_object(&request) => {
                let object = object.map_err(|e| StorageError::backend("get object", e))?;
                Ok(object.metadata.unwrap_or_default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_account_validation() {
        assert!(validate_service_account_json(r#"{"type":"service_account","project_id":"p"}"#).is_ok());
        assert!(validate_service_account_json(r#"{"type":"authorized_user"}"#).is_err());
        assert!(validate_service_account_json("not json").is_err());
    }

    #[test]
    fn test_listing_strips_prefix_and_keeps_metadata() {
        let object = Object {
            name: "backup/2024/05/backup-pg16-2024-05-01T00-00-00-000Z.tar.gz".into(),
            size: 42,
            metadata: Some(HashMap::from([("backup-tool".to_string(), "pgbackup".to_string())])),
            ..Default::default()
        };
        let descriptor = to_descriptor("backup", object);
        assert_eq!(descriptor.key, "2024/05/backup-pg16-2024-05-01T00-00-00-000Z.tar.gz");
        assert_eq!(descriptor.size, 42);
        assert_eq!(descriptor.metadata.get("backup-tool").map(String::as_str), Some("pgbackup"));
    }
}
