use crate::db::connection::DbPool;
use crate::models::export_job::{self, ExportJob};
use backup_export::BackupJob;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Notify;

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: ExportJob,
    /// The idempotency key was already on record; nothing new was queued.
    pub duplicate: bool,
}

/// The ledger seen as a queue: submit appends, consumers claim. Submitting
/// wakes consumers in this process; others pick the job up on their next poll.
#[derive(Clone)]
pub struct JobQueue {
    db: DbPool,
    wake: Arc<Notify>,
}

/// Idempotency keys are stored hashed.
pub fn hash_idempotency_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.trim().as_bytes()))
}

impl JobQueue {
    pub fn new(db: DbPool) -> Self {
        Self {
            db,
            wake: Arc::new(Notify::new()),
        }
    }

    pub async fn submit(
        &self,
        job: BackupJob,
        idempotency_key: Option<&str>,
    ) -> anyhow::Result<Submission> {
        let key = idempotency_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(hash_idempotency_key);
        let db = self.db.clone();
        let (job, duplicate) = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            export_job::create(&conn, &job, key.as_deref())
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        if duplicate {
            tracing::info!(job_id = %job.id, status = %job.status, "duplicate submission, returning existing job");
        } else {
            tracing::info!(job_id = %job.id, tenant_id = job.tenant_id, "export job queued");
            self.wake.notify_one();
        }
        Ok(Submission { job, duplicate })
    }

    /// Resolves once something was submitted through this queue.
    pub async fn submitted(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connection::create_pool, migrate::migrate};
    use backup_export::SourceConnection;
    use std::time::Duration;

    fn job() -> BackupJob {
        BackupJob {
            tenant_id: 21,
            recipient_email: "owner@clinic.test".into(),
            source_connection: SourceConnection {
                host: "db".into(),
                database: "clinic".into(),
                user: String::new(),
                password: String::new(),
            },
            destination_bucket: "exports".into(),
            destination_prefix: None,
            include_assets: false,
        }
    }

    #[test]
    fn test_key_hash_is_hex_sha256() {
        let h = hash_idempotency_key(" abc ");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_idempotency_key("abc"));
    }

    #[tokio::test]
    async fn test_submit_dedupes_and_wakes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("jobs.db").to_string_lossy()).unwrap();
        migrate(&pool, dir.path()).unwrap();
        let queue = JobQueue::new(pool.clone());

        let first = queue.submit(job(), Some("req-1")).await.unwrap();
        assert!(!first.duplicate);
        tokio::time::timeout(Duration::from_secs(1), queue.submitted())
            .await
            .expect("submit wakes the consumer");

        let second = queue.submit(job(), Some("req-1")).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(first.job.id, second.job.id);

        let stored = pool.get().unwrap().query_row(
            "SELECT idempotency_key FROM export_jobs WHERE id = ?1",
            [&first.job.id],
            |r| r.get::<_, String>(0),
        );
        assert_eq!(stored.unwrap(), hash_idempotency_key("req-1"));
    }
}
