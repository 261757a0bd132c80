// pgbackup/src/storage/memory.rs
//! In-memory backend with failure injection, used by tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use super::{ObjectDescriptor, ObjectStorage, UploadBody, send_buffered};
use crate::errors::StorageError;
use crate::utils::retry::RetryPolicy;

/// Buffered uploads are committed like a real backend sends its parts.
const COMMIT_RETRY: RetryPolicy = RetryPolicy::storage_default();

#[derive(Debug, Clone)]
pub(crate) struct StoredObject {
    pub data: Vec<u8>,
    pub last_modified: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// Knobs for making the next calls fail.
#[derive(Debug, Default)]
pub(crate) struct Failures {
    /// Number of upcoming `list` calls that fail.
    pub list: u32,
    /// Number of upcoming uploads that fail before reading the body.
    pub upload: u32,
    /// Uploads read part of the body and then fail.
    pub upload_mid_stream: bool,
    /// Number of upcoming commits that fail after the whole body was buffered.
    pub commit: u32,
    pub metadata: bool,
    pub delete_keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    failures: Failures,
    calls: HashMap<&'static str, u32>,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        key: &str,
        last_modified: DateTime<Utc>,
        metadata: HashMap<String, String>,
    ) {
        self.state.lock().unwrap().objects.insert(
            key.to_string(),
            StoredObject {
                data: Vec::new(),
                last_modified,
                metadata,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn calls(&self, operation: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail(&self, configure: impl FnOnce(&mut Failures)) {
        configure(&mut self.state.lock().unwrap().failures);
    }

    fn record(&self, operation: &'static str) {
        *self
            .state
            .lock()
            .unwrap()
            .calls
            .entry(operation)
            .or_insert(0) += 1;
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        body: UploadBody<'_>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.record("upload");
        let (fail_now, mid_stream) = {
            let mut state = self.state.lock().unwrap();
            let failures = &mut state.failures;
            let fail_now = failures.upload > 0;
            failures.upload = failures.upload.saturating_sub(1);
            (fail_now, failures.upload_mid_stream)
        };
        if fail_now {
            return Err(StorageError::backend("upload", "503 Service Unavailable"));
        }
        if mid_stream {
            let mut first = [0u8; 1];
            body.read(&mut first).await.map_err(StorageError::Body)?;
            return Err(StorageError::backend("upload", "connection reset by peer"));
        }

        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .map_err(StorageError::Body)?;

        let (state, data) = (&self.state, &data);
        send_buffered(&COMMIT_RETRY, cancel, &Span::none(), "upload", move || async move {
            let mut state = state.lock().unwrap();
            *state.calls.entry("commit").or_insert(0) += 1;
            if state.failures.commit > 0 {
                state.failures.commit -= 1;
                return Err(StorageError::backend("upload", "503 SlowDown"));
            }
            state.objects.insert(
                key.to_string(),
                StoredObject {
                    data: data.clone(),
                    last_modified: Utc::now(),
                    metadata: metadata.clone(),
                },
            );
            Ok(())
        })
        .await
    }

    async fn delete(&self, _cancel: &CancellationToken, key: &str) -> Result<(), StorageError> {
        self.record("delete");
        let mut state = self.state.lock().unwrap();
        if state.failures.delete_keys.contains(key) {
            return Err(StorageError::backend("delete", "AccessDenied"));
        }
        state.objects.remove(key);
        Ok(())
    }

    async fn list(
        &self,
        _cancel: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<ObjectDescriptor>, StorageError> {
        self.record("list");
        let mut state = self.state.lock().unwrap();
        if state.failures.list > 0 {
            state.failures.list -= 1;
            return Err(StorageError::backend("list", "connection refused"));
        }
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectDescriptor {
                key: key.clone(),
                size: object.data.len() as i64,
                last_modified: object.last_modified,
                metadata: HashMap::new(),
            })
            .collect())
    }

    async fn metadata(
        &self,
        _cancel: &CancellationToken,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        self.record("metadata");
        let state = self.state.lock().unwrap();
        if state.failures.metadata {
            return Err(StorageError::backend("metadata", "timeout"));
        }
        state
            .objects
            .get(key)
            .map(|object| object.metadata.clone())
            .ok_or_else(|| StorageError::backend("metadata", format!("no such key: {key}")))
    }
}
