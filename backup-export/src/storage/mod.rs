//! Object store abstraction and the key conventions shared by its backends.

pub mod local;
pub mod memory;
pub mod s3;
pub mod signing;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::transfer::ByteStream;
use crate::utils::errors::Result;

pub use local::LocalFsObjectStore;
pub use memory::InMemoryObjectStore;
pub use s3::{S3ObjectStore, S3Settings};
pub use signing::UrlSigner;

pub const CONTENT_TYPE_XLSX: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const CONTENT_TYPE_ZIP: &str = "application/zip";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
pub const CONTENT_TYPE_FOLDER: &str = "application/x-directory";

/// Key-based object storage. Keys ending in `/` are folder markers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes, content_type: &str)
        -> Result<()>;

    /// Store a streamed body. The object only becomes visible if the stream
    /// ends without error. Returns the number of bytes stored.
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<u64>;

    /// Open `<key_prefix>/<key>` (or just `key` without a prefix) for reading.
    async fn get_stream(&self, bucket: &str, key_prefix: Option<&str>, key: &str)
        -> Result<ByteStream>;

    /// Issue a credential-free retrieval URL valid for `ttl`.
    async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;
}

/// Join a prefix and a key with exactly one `/` between them.
pub fn join_key(prefix: Option<&str>, key: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{}/{}", p, key.trim_start_matches('/')),
        None => key.trim_start_matches('/').to_string(),
    }
}

pub fn folder_marker_key(folder: &str) -> String {
    format!("{}/", folder.trim_end_matches('/'))
}

pub fn is_folder_marker(key: &str) -> bool {
    key.ends_with('/')
}
