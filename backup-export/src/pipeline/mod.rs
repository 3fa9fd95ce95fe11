//! Backup pipeline - Orchestrates one export job end to end.
//!
//! Ties together:
//! - Destination and folder resolution
//! - Streaming document generation and upload
//! - The optional asset archive
//! - The README manifest
//! - Requester notification

pub mod destination;
pub mod manifest;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::archive::{archive_assets, collect_unique_references, ArchiveSettings, ArchiveTarget};
use crate::document::{build_document, DocumentSummary};
use crate::model::{ArchiveManifest, BackupArtifacts, BackupJob};
use crate::notify::{AssetSummary, BackupNotice, Notifier};
use crate::source::{RecordSource, SectionSpec, SECTIONS};
use crate::storage::{
    folder_marker_key, ObjectStore, CONTENT_TYPE_FOLDER, CONTENT_TYPE_TEXT, CONTENT_TYPE_XLSX,
};
use crate::transfer::{conduit, settle, ByteStream, ProgressStream};
use crate::utils::errors::Result;

pub use destination::{artifact_key, Destination, ARCHIVE_NAME, DOCUMENT_NAME, MANIFEST_NAME};
pub use manifest::render_manifest;

/// Seven days.
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(604_800);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Lifetime of issued retrieval URLs.
    pub url_ttl: Duration,
    pub sections: &'static [SectionSpec],
    /// Chunks buffered between the document writer and its upload.
    pub conduit_capacity: usize,
    pub progress_interval: Duration,
    pub archive: ArchiveSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            url_ttl: DEFAULT_URL_TTL,
            sections: SECTIONS,
            conduit_capacity: 16,
            progress_interval: Duration::from_secs(5),
            archive: ArchiveSettings::default(),
        }
    }
}

/// What a finished job produced.
#[derive(Debug)]
pub struct BackupReport {
    pub artifacts: BackupArtifacts,
    pub document: DocumentSummary,
    pub document_bytes: u64,
    pub notified: bool,
}

pub struct BackupPipeline {
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn RecordSource>,
    notifier: Arc<dyn Notifier>,
    config: PipelineConfig,
}

impl BackupPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        source: Arc<dyn RecordSource>,
        notifier: Arc<dyn Notifier>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, job: &BackupJob) -> Result<BackupReport> {
        self.run_at(job, Utc::now()).await
    }

    /// Run `job` with `started` as the folder timestamp.
    ///
    /// Fails if the document cannot be generated or stored. Archive and
    /// notification failures are logged and reflected in the report.
    pub async fn run_at(&self, job: &BackupJob, started: DateTime<Utc>) -> Result<BackupReport> {
        job.validate()?;

        let destination =
            Destination::resolve(&job.destination_bucket, job.destination_prefix.as_deref())?;
        let database = job.source_connection.database.trim();
        let folder = destination.backup_folder(database, job.tenant_id, started);
        let bucket = destination.bucket.as_str();

        info!(
            tenant_id = job.tenant_id,
            bucket,
            folder = %folder,
            include_assets = job.include_assets,
            "starting backup"
        );

        self.ensure_folder(bucket, &folder).await?;

        // Document: generated and uploaded at the same time.
        let document_key = artifact_key(&folder, DOCUMENT_NAME);
        let (sink, body) = conduit(self.config.conduit_capacity);
        let body = self.with_progress(body, job.tenant_id);
        let upload = self
            .store
            .put_stream(bucket, &document_key, body, CONTENT_TYPE_XLSX);
        let build = build_document(
            self.source.as_ref(),
            self.config.sections,
            job,
            job.include_assets,
            sink,
        );
        let (built, uploaded) = tokio::join!(build, upload);
        let (document, document_bytes) = settle(built, uploaded)?;
        let document_url = self
            .store
            .presign(bucket, &document_key, self.config.url_ttl)
            .await?;

        info!(
            tenant_id = job.tenant_id,
            key = %document_key,
            sheets = document.sheets.len(),
            skipped = document.skipped_sections.len(),
            bytes = document_bytes,
            "document uploaded"
        );

        // Assets
        let archive = if job.include_assets {
            self.archive(job, &destination, &folder, &document).await
        } else {
            None
        };
        let archive_url = match archive.as_ref().and_then(|m| m.archive_key.as_deref()) {
            Some(key) => Some(self.store.presign(bucket, key, self.config.url_ttl).await?),
            None => None,
        };

        // README
        let manifest_key = artifact_key(&folder, MANIFEST_NAME);
        let readme = render_manifest(job.tenant_id, database, started, archive.as_ref());
        self.store
            .put_object(bucket, &manifest_key, readme.into_bytes().into(), CONTENT_TYPE_TEXT)
            .await?;

        let artifacts = BackupArtifacts {
            bucket: bucket.to_string(),
            folder,
            document_key,
            document_url,
            manifest_key,
            archive,
            archive_url,
        };

        let notified = self.notify(job, database, started, &artifacts).await;

        info!(
            tenant_id = job.tenant_id,
            folder = %artifacts.folder,
            notified,
            "backup finished"
        );

        Ok(BackupReport {
            artifacts,
            document,
            document_bytes,
            notified,
        })
    }

    async fn ensure_folder(&self, bucket: &str, folder: &str) -> Result<()> {
        let marker = folder_marker_key(folder);
        if self.store.exists(bucket, &marker).await? {
            info!(bucket, marker = %marker, "backup folder already exists");
            return Ok(());
        }
        self.store
            .put_object(bucket, &marker, bytes::Bytes::new(), CONTENT_TYPE_FOLDER)
            .await
    }

    fn with_progress(&self, body: ByteStream, tenant_id: i64) -> ByteStream {
        let callback = Arc::new(move |bytes: u64, done: bool| {
            if done {
                tracing::debug!(tenant_id, bytes, "document stream complete");
            } else {
                tracing::debug!(tenant_id, bytes, "document upload progress");
            }
        });
        ProgressStream::new(body, self.config.progress_interval, callback).boxed()
    }

    /// Archive the collected references. `None` when there is nothing to
    /// archive.
    async fn archive(
        &self,
        job: &BackupJob,
        destination: &Destination,
        folder: &str,
        document: &DocumentSummary,
    ) -> Option<ArchiveManifest> {
        let references = collect_unique_references(&document.asset_references);
        if references.is_empty() {
            info!(tenant_id = job.tenant_id, "no asset references, skipping archive");
            return None;
        }

        let key = artifact_key(folder, ARCHIVE_NAME);
        let target = ArchiveTarget {
            source_bucket: &destination.bucket,
            source_prefix: destination.prefix.as_deref(),
            bucket: &destination.bucket,
            key: &key,
        };

        match archive_assets(self.store.as_ref(), &references, &target, self.config.archive).await {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(
                    tenant_id = job.tenant_id,
                    error = %e,
                    total = references.len(),
                    "asset archive failed, continuing without it"
                );
                Some(ArchiveManifest {
                    total: references.len(),
                    archived: 0,
                    archive_key: None,
                })
            }
        }
    }

    async fn notify(
        &self,
        job: &BackupJob,
        database: &str,
        started: DateTime<Utc>,
        artifacts: &BackupArtifacts,
    ) -> bool {
        let notice = BackupNotice {
            recipient: job.recipient_email.trim().to_string(),
            tenant_id: job.tenant_id,
            document_url: artifacts.document_url.clone(),
            database_label: database.to_string(),
            assets: artifacts.archive.as_ref().map(|m| AssetSummary {
                total: m.total,
                archived: m.archived,
                archive_url: artifacts.archive_url.clone(),
            }),
            generated_at: started,
            valid_for_days: (self.config.url_ttl.as_secs() / 86_400).max(1),
        };

        match self.notifier.notify(&notice).await {
            Ok(()) => true,
            Err(e) => {
                warn!(tenant_id = job.tenant_id, error = %e, "notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_url_ttl_is_seven_days() {
        let config = PipelineConfig::default();
        assert_eq!(config.url_ttl.as_secs(), 604_800);
        assert_eq!(config.sections.len(), SECTIONS.len());
    }
}
