//! S3-compatible object store.
//!
//! Streamed bodies are buffered up to one part. Bodies that fit in a single
//! part are stored with a plain `PutObject`; larger ones go through a
//! multipart upload that is completed only after the stream ended cleanly
//! and aborted otherwise, so a broken stream never leaves an object behind.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{join_key, ObjectStore};
use crate::transfer::ByteStream;
use crate::utils::errors::{ExportError, Result};

/// S3 rejects non-final multipart parts smaller than this.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Clone)]
pub struct S3Settings {
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    pub part_size: usize,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            part_size: 8 * 1024 * 1024,
        }
    }
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("force_path_style", &self.force_path_style)
            .field("part_size", &self.part_size)
            .finish()
    }
}

pub struct S3ObjectStore {
    client: Client,
    part_size: usize,
}

struct MultipartUpload {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

fn storage_error(action: &str, target: &str, err: impl std::error::Error) -> ExportError {
    ExportError::Storage(format!("{} {} failed: {}", action, target, DisplayErrorContext(err)))
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS configuration, overridden by any
    /// explicit settings.
    pub async fn connect(settings: &S3Settings) -> Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(settings.region.clone()));

        match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(key), Some(secret)) => {
                loader = loader.credentials_provider(Credentials::new(
                    key.clone(),
                    secret.clone(),
                    None,
                    None,
                    "backup-export",
                ));
            }
            (None, None) => {}
            _ => {
                return Err(ExportError::Config(
                    "S3 access key id and secret access key must be set together".into(),
                ))
            }
        }

        let shared = loader.load().await;
        let mut config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(settings.force_path_style);
        if let Some(endpoint) = &settings.endpoint {
            config = config.endpoint_url(endpoint);
        }

        Ok(Self::from_client(Client::from_conf(config.build()), settings.part_size))
    }

    pub fn from_client(client: Client, part_size: usize) -> Self {
        Self {
            client,
            part_size: part_size.max(MIN_PART_SIZE),
        }
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    async fn start_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<MultipartUpload> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| storage_error("CreateMultipartUpload", key, e))?;
        let upload_id = output.upload_id().ok_or_else(|| {
            ExportError::Storage(format!("CreateMultipartUpload {} returned no upload id", key))
        })?;
        debug!(bucket, key, upload_id, "Multipart upload started");
        Ok(MultipartUpload {
            upload_id: upload_id.to_string(),
            parts: Vec::new(),
        })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload: &mut MultipartUpload,
        body: Bytes,
    ) -> Result<()> {
        let part_number = i32::try_from(upload.parts.len() + 1)
            .map_err(|_| ExportError::Storage(format!("too many parts for {}", key)))?;
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|e| storage_error("UploadPart", key, e))?;
        upload.parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    /// Read the whole body, uploading parts as they fill. `upload` is left
    /// populated once a multipart upload was started so the caller can abort
    /// it on failure.
    async fn upload_body(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        mut body: ByteStream,
        upload: &mut Option<MultipartUpload>,
    ) -> Result<u64> {
        let mut buffer = BytesMut::with_capacity(self.part_size);
        let mut total = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= self.part_size {
                let part = buffer.split_to(self.part_size).freeze();
                if upload.is_none() {
                    *upload = Some(self.start_multipart(bucket, key, content_type).await?);
                }
                if let Some(current) = upload.as_mut() {
                    self.upload_part(bucket, key, current, part).await?;
                }
            }
        }

        let Some(current) = upload.as_mut() else {
            self.put_object(bucket, key, buffer.freeze(), content_type).await?;
            return Ok(total);
        };

        if !buffer.is_empty() {
            self.upload_part(bucket, key, current, buffer.freeze()).await?;
        }
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&current.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(current.parts.clone()))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| storage_error("CompleteMultipartUpload", key, e))?;
        debug!(bucket, key, parts = current.parts.len(), total, "Multipart upload completed");
        Ok(total)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(storage_error("HeadObject", key, e)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|e| storage_error("PutObject", key, e))?;
        Ok(())
    }

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<u64> {
        let mut upload = None;
        let result = self.upload_body(bucket, key, content_type, body, &mut upload).await;

        if let (Err(_), Some(current)) = (&result, &upload) {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&current.upload_id)
                .send()
                .await
            {
                warn!(bucket, key, error = %DisplayErrorContext(e), "Failed to abort multipart upload");
            }
        }
        result
    }

    async fn get_stream(
        &self,
        bucket: &str,
        key_prefix: Option<&str>,
        key: &str,
    ) -> Result<ByteStream> {
        let full_key = join_key(key_prefix, key);
        let output = match self.client.get_object().bucket(bucket).key(&full_key).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) => {
                return Err(ExportError::NotFound(format!("{}/{}", bucket, full_key)))
            }
            Err(e) => return Err(storage_error("GetObject", &full_key, e)),
        };

        let body = stream::unfold(output.body, |mut body| async move {
            body.next()
                .await
                .map(|chunk| (chunk.map_err(std::io::Error::other), body))
        });
        Ok(body.boxed())
    }

    async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| ExportError::Config(format!("invalid URL TTL {:?}: {}", ttl, e)))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| storage_error("Presign", key, e))?;
        Ok(request.uri().to_string())
    }
}
