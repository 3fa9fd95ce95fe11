//! In-process object store, used by tests and dry runs.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{join_key, ObjectStore};
use crate::transfer::ByteStream;
use crate::utils::errors::{ExportError, Result};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(String, String), StoredObject>,
    failing_reads: HashSet<String>,
    truncated_reads: HashSet<String>,
    rejected_uploads: HashMap<String, String>,
    writes: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    inner: Mutex<Inner>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>, content_type: &str) {
        self.lock().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Every `bucket/key` written through the store, in write order.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Make opening `key` (full key, prefix included) fail.
    pub fn fail_reads_of(&self, key: &str) {
        self.lock().failing_reads.insert(key.to_string());
    }

    /// Make reads of `key` yield one chunk and then an error.
    pub fn truncate_reads_of(&self, key: &str) {
        self.lock().truncated_reads.insert(key.to_string());
    }

    /// Make streamed uploads to `key` fail with `message` without reading the body.
    pub fn reject_uploads_of(&self, key: &str, message: &str) {
        self.lock()
            .rejected_uploads
            .insert(key.to_string(), message.to_string());
    }

    fn record(&self, bucket: &str, key: &str, body: Bytes, content_type: &str) {
        let mut inner = self.lock();
        inner.writes.push(format!("{}/{}", bucket, key));
        inner.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .lock()
            .objects
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<()> {
        self.record(bucket, key, body, content_type);
        Ok(())
    }

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<u64> {
        let rejected = self.lock().rejected_uploads.get(key).cloned();
        if let Some(message) = rejected {
            return Err(ExportError::Storage(message));
        }
        let collected = body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map_err(|e| {
                ExportError::Storage(format!("upload body for {}/{} failed: {}", bucket, key, e))
            })?;
        let len = collected.len() as u64;
        self.record(bucket, key, Bytes::from(collected), content_type);
        Ok(len)
    }

    async fn get_stream(
        &self,
        bucket: &str,
        key_prefix: Option<&str>,
        key: &str,
    ) -> Result<ByteStream> {
        let full_key = join_key(key_prefix, key);
        let inner = self.lock();
        if inner.failing_reads.contains(&full_key) {
            return Err(ExportError::Storage(format!("read of {}/{} refused", bucket, full_key)));
        }
        let object = inner
            .objects
            .get(&(bucket.to_string(), full_key.clone()))
            .ok_or_else(|| ExportError::NotFound(format!("{}/{}", bucket, full_key)))?;

        let body = object.body.clone();
        let mut chunks: Vec<std::io::Result<Bytes>> = (0..body.len())
            .step_by(READ_CHUNK)
            .map(|start| Ok(body.slice(start..(start + READ_CHUNK).min(body.len()))))
            .collect();
        if inner.truncated_reads.contains(&full_key) {
            chunks.truncate(1);
            chunks.push(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "source stream interrupted",
            )));
        }
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://{}/{}?ttl={}", bucket, key, ttl.as_secs()))
    }
}
