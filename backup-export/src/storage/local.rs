//! Filesystem-backed object store.
//!
//! Buckets are directories under `root`; object keys map to relative paths.
//! Folder markers (`key/`) are stored as a `.folder-marker` file inside the
//! folder. Streamed writes go to a temporary file in the destination
//! directory and are renamed into place only after the body completed.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Url;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{is_folder_marker, join_key, ObjectStore, UrlSigner};
use crate::transfer::ByteStream;
use crate::utils::errors::{ExportError, Result};

const FOLDER_MARKER_FILE: &str = ".folder-marker";

pub struct LocalFsObjectStore {
    root: PathBuf,
    public_base_url: Url,
    signer: UrlSigner,
}

impl LocalFsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str, signer: UrlSigner) -> Result<Self> {
        let public_base_url = Url::parse(public_base_url).map_err(|e| {
            ExportError::Config(format!("invalid public base URL {}: {}", public_base_url, e))
        })?;
        if public_base_url.cannot_be_a_base() {
            return Err(ExportError::Config(format!(
                "public base URL {} cannot carry a path",
                public_base_url
            )));
        }
        Ok(Self {
            root: root.into(),
            public_base_url,
            signer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Resolve an object to its on-disk path, refusing anything that could
    /// escape the bucket directory.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_segment(bucket, "bucket")?;
        let trimmed = key.trim_end_matches('/');
        if trimmed.is_empty() || key.starts_with('/') {
            return Err(ExportError::Storage(format!("invalid object key: {:?}", key)));
        }

        let mut path = self.root.join(bucket);
        for segment in trimmed.split('/') {
            validate_segment(segment, "key segment")?;
            if segment == FOLDER_MARKER_FILE {
                return Err(ExportError::Storage(format!("reserved key segment in {:?}", key)));
            }
            path.push(segment);
        }
        if is_folder_marker(key) {
            path.push(FOLDER_MARKER_FILE);
        }
        Ok(path)
    }
}

fn validate_segment(segment: &str, what: &str) -> Result<()> {
    let mut components = Path::new(segment).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if segment.is_empty() || !single_normal || segment.contains('/') || segment.contains('\\') {
        return Err(ExportError::Storage(format!("invalid {}: {:?}", what, segment)));
    }
    Ok(())
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent().ok_or_else(|| {
        ExportError::Storage(format!("cannot determine parent directory for {}", path.display()))
    })
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.object_path(bucket, key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<()> {
        let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(body) }).boxed();
        self.put_stream(bucket, key, stream, content_type).await?;
        Ok(())
    }

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        content_type: &str,
    ) -> Result<u64> {
        let final_path = self.object_path(bucket, key)?;
        let dir = parent_of(&final_path)?.to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let temp = tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(dir))
            .await??;
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        // temp_path deletes the partial file if anything below fails
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                ExportError::Storage(format!("upload body for {}/{} failed: {}", bucket, key, e))
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let target = final_path.clone();
        tokio::task::spawn_blocking(move || temp_path.persist(&target))
            .await?
            .map_err(|e| {
                ExportError::Storage(format!(
                    "failed to persist {}: {}",
                    final_path.display(),
                    e.error
                ))
            })?;

        tracing::debug!(bucket, key, content_type, bytes = written, "object stored");
        Ok(written)
    }

    async fn get_stream(
        &self,
        bucket: &str,
        key_prefix: Option<&str>,
        key: &str,
    ) -> Result<ByteStream> {
        let full_key = join_key(key_prefix, key);
        let path = self.object_path(bucket, &full_key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(ReaderStream::new(file).boxed()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ExportError::NotFound(format!("{}/{}", bucket, full_key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        self.object_path(bucket, key)?;
        let ttl_secs = i64::try_from(ttl.as_secs())
            .map_err(|_| ExportError::Config(format!("URL TTL too large: {:?}", ttl)))?;
        let expires = chrono::Utc::now().timestamp() + ttl_secs;
        let signature = self.signer.sign(bucket, key, expires)?;

        let mut url = self.public_base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ExportError::Config("public base URL cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["api", "artifacts", bucket])
            .extend(key.split('/'));
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    fn store(dir: &Path) -> LocalFsObjectStore {
        LocalFsObjectStore::new(dir, "http://localhost:3000", UrlSigner::new("k")).unwrap()
    }

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, c| async move {
                acc.extend_from_slice(&c);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_object_path_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        assert!(s.object_path("b", "../x").is_err());
        assert!(s.object_path("b", "a/../../x").is_err());
        assert!(s.object_path("..", "x").is_err());
        assert!(s.object_path("b", "/abs").is_err());
        assert!(s.object_path("b", "a//b").is_err());
        assert!(s.object_path("b", "a/.folder-marker").is_err());
        assert_eq!(
            s.object_path("b", "a/c.txt").unwrap(),
            tmp.path().join("b").join("a").join("c.txt")
        );
    }

    #[tokio::test]
    async fn test_folder_marker_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        assert!(!s.exists("b", "backup-temp/x/").await.unwrap());
        s.put_object("b", "backup-temp/x/", Bytes::new(), super::super::CONTENT_TYPE_FOLDER)
            .await
            .unwrap();
        assert!(s.exists("b", "backup-temp/x/").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_write_and_prefixed_read() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let body = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ])
        .boxed();
        let n = s.put_stream("b", "tenant/img/1.jpg", body, "image/jpeg").await.unwrap();
        assert_eq!(n, 6);

        let data = read_all(s.get_stream("b", Some("tenant"), "img/1.jpg").await.unwrap()).await;
        assert_eq!(data, b"abcdef");
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let body = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "producer died")),
        ])
        .boxed();
        assert!(s.put_stream("b", "f/DOCUMENT.xlsx", body, "x").await.is_err());
        assert!(!s.exists("b", "f/DOCUMENT.xlsx").await.unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("b").join("f"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let err = s.get_stream("b", None, "nope.jpg").await.err().unwrap();
        assert!(matches!(err, ExportError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_presigned_url_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let url = s.presign("b", "f/DOCUMENT.xlsx", Duration::from_secs(604_800)).await.unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/api/artifacts/b/f/DOCUMENT.xlsx");

        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        let expires: i64 = pairs["expires"].parse().unwrap();
        let now = chrono::Utc::now().timestamp();
        assert!(expires - now > 604_000 && expires - now <= 604_800);
        assert!(s.signer().verify("b", "f/DOCUMENT.xlsx", expires, &pairs["signature"], now));
    }
}
