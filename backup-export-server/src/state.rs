use crate::config::{AppConfig, StorageBackend};
use crate::db::connection::DbPool;
use crate::services::job_queue::JobQueue;
use backup_export::storage::{LocalFsObjectStore, ObjectStore, S3ObjectStore, UrlSigner};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Where artifacts are written. Only the local backend is served by this
/// process; S3 URLs point straight at the bucket.
#[derive(Clone)]
pub enum Storage {
    Local(Arc<LocalFsObjectStore>),
    S3(Arc<S3ObjectStore>),
}

impl Storage {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        match config.storage_backend {
            StorageBackend::Local => Self::local(config),
            StorageBackend::S3 => {
                let store = S3ObjectStore::connect(&config.s3_settings()).await?;
                Ok(Storage::S3(Arc::new(store)))
            }
        }
    }

    pub fn local(config: &AppConfig) -> anyhow::Result<Self> {
        let signer = UrlSigner::new(&config.url_signing_secret);
        let store = LocalFsObjectStore::new(&config.storage_root, &config.public_base_url, signer)?;
        Ok(Storage::Local(Arc::new(store)))
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        match self {
            Storage::Local(store) => store.clone(),
            Storage::S3(store) => store.clone(),
        }
    }

    pub fn local_fs(&self) -> Option<&Arc<LocalFsObjectStore>> {
        match self {
            Storage::Local(store) => Some(store),
            Storage::S3(_) => None,
        }
    }
}

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub queue: JobQueue,
    pub store: Storage,
    api_key_digest: [u8; 32],
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, store: Storage) -> Self {
        let api_key_digest = Sha256::digest(config.intake_api_key.as_bytes()).into();
        Self {
            queue: JobQueue::new(db.clone()),
            db,
            config,
            store,
            api_key_digest,
        }
    }

    /// Compares digests so the check doesn't depend on where the keys differ.
    pub fn api_key_matches(&self, provided: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
        digest
            .iter()
            .zip(self.api_key_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
