use crate::db::connection::DbPool;
use crate::models::export_job::{self, ClaimedJob};
use crate::services::job_queue::JobQueue;
use backup_export::BackupPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a claimed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { job_id: String },
    Failed { job_id: String, error: String },
}

/// Single-threaded pull loop: claim one job, run it to completion, record
/// the outcome, repeat. Failed jobs are not retried.
pub struct JobConsumer {
    db: DbPool,
    queue: JobQueue,
    pipeline: Arc<BackupPipeline>,
    worker_id: String,
    poll_interval: Duration,
    stale_lease: Duration,
}

impl JobConsumer {
    pub fn new(
        db: DbPool,
        queue: JobQueue,
        pipeline: Arc<BackupPipeline>,
        worker_id: String,
        poll_interval: Duration,
        stale_lease: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            pipeline,
            worker_id,
            poll_interval,
            stale_lease,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(worker_id = %self.worker_id, "Job consumer started");
        loop {
            if let Err(e) = self.requeue_stale().await {
                warn!("Stale job requeue failed: {:#}", e);
            }

            // Drain everything queued before waiting again.
            while !cancel.is_cancelled() {
                match self.run_next().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Job claim failed: {:#}", e);
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.queue.submitted() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(worker_id = %self.worker_id, "Job consumer stopped");
    }

    async fn requeue_stale(&self) -> anyhow::Result<()> {
        let db = self.db.clone();
        let lease = self.stale_lease;
        let requeued = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            export_job::requeue_stale(&conn, lease)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
        if requeued > 0 {
            warn!(requeued, "Requeued jobs whose worker stopped responding");
        }
        Ok(())
    }

    async fn claim(&self) -> anyhow::Result<Option<ClaimedJob>> {
        let db = self.db.clone();
        let worker_id = self.worker_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            export_job::claim_next(&mut conn, &worker_id)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    /// Claim and run one job. `None` when the queue is empty.
    pub async fn run_next(&self) -> anyhow::Result<Option<JobOutcome>> {
        let Some(claimed) = self.claim().await? else {
            return Ok(None);
        };
        let job_id = claimed.id.clone();
        info!(
            job_id = %job_id,
            tenant_id = claimed.job.tenant_id,
            attempt = claimed.attempts,
            "Running export job"
        );

        let result = self.pipeline.run(&claimed.job).await;

        let db = self.db.clone();
        let lease = claimed.lease();
        let (outcome, recorded) = match result {
            Ok(report) => {
                info!(
                    job_id = %job_id,
                    folder = %report.artifacts.folder,
                    notified = report.notified,
                    "Export job succeeded"
                );
                let recorded = tokio::task::spawn_blocking(move || {
                    let conn = db.get()?;
                    export_job::mark_succeeded(&conn, &lease, &report.artifacts, report.notified)
                })
                .await
                .map_err(|e| anyhow::anyhow!(e))??;
                (JobOutcome::Succeeded { job_id }, recorded)
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id = %job_id, error = %message, "Export job failed");
                let error_text = message.clone();
                let recorded = tokio::task::spawn_blocking(move || {
                    let conn = db.get()?;
                    export_job::mark_failed(&conn, &lease, &error_text)
                })
                .await
                .map_err(|e| anyhow::anyhow!(e))??;
                (
                    JobOutcome::Failed {
                        job_id,
                        error: message,
                    },
                    recorded,
                )
            }
        };
        if !recorded {
            warn!(
                job_id = %claimed.id,
                attempt = claimed.attempts,
                "Job was requeued while running; outcome not recorded"
            );
        }
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connection::create_pool, migrate::migrate};
    use crate::models::export_job::{STATUS_FAILED, STATUS_SUCCEEDED};
    use async_trait::async_trait;
    use backup_export::notify::RecordingNotifier;
    use backup_export::source::{RecordSource, SectionSpec};
    use backup_export::storage::InMemoryObjectStore;
    use backup_export::{BackupJob, ExportError, PipelineConfig, Record, SourceConnection};

    static SECTIONS: &[SectionSpec] = &[SectionSpec {
        name: "Patients",
        query: "patients",
        asset_field: None,
    }];

    struct OneSection;

    #[async_trait]
    impl RecordSource for OneSection {
        async fn fetch(
            &self,
            section: &SectionSpec,
            tenant_id: i64,
            _connection: &SourceConnection,
        ) -> backup_export::Result<Vec<Record>> {
            if tenant_id == 13 {
                return Err(ExportError::source_failure(section.name, "access denied"));
            }
            Ok(vec![Record::new().with("id", 1i64).with("name", "Ana")])
        }
    }

    fn job(tenant_id: i64) -> BackupJob {
        BackupJob {
            tenant_id,
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

    fn consumer(pool: DbPool, queue: JobQueue, notifier: Arc<RecordingNotifier>) -> JobConsumer {
        let pipeline = BackupPipeline::new(
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(OneSection),
            notifier,
            PipelineConfig {
                sections: SECTIONS,
                ..PipelineConfig::default()
            },
        );
        JobConsumer::new(
            pool,
            queue,
            Arc::new(pipeline),
            "test-worker".into(),
            Duration::from_millis(50),
            Duration::from_secs(3600),
        )
    }

    fn setup() -> (tempfile::TempDir, DbPool, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("jobs.db").to_string_lossy()).unwrap();
        migrate(&pool, dir.path()).unwrap();
        let queue = JobQueue::new(pool.clone());
        (dir, pool, queue)
    }

    fn status_of(pool: &DbPool, id: &str) -> export_job::ExportJob {
        let conn = pool.get().unwrap();
        export_job::find_by_id(&conn, id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_run_next_records_outcomes() {
        let (_dir, pool, queue) = setup();
        let notifier = Arc::new(RecordingNotifier::new());
        let ok = queue.submit(job(21), None).await.unwrap().job;
        let bad = queue.submit(job(13), None).await.unwrap().job;
        let consumer = consumer(pool.clone(), queue, notifier.clone());

        assert_eq!(
            consumer.run_next().await.unwrap(),
            Some(JobOutcome::Succeeded { job_id: ok.id.clone() })
        );
        match consumer.run_next().await.unwrap() {
            Some(JobOutcome::Failed { job_id, error }) => {
                assert_eq!(job_id, bad.id);
                assert!(error.contains("access denied"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(consumer.run_next().await.unwrap(), None);

        let done = status_of(&pool, &ok.id);
        assert_eq!(done.status, STATUS_SUCCEEDED);
        assert!(done.document_key.unwrap().ends_with("/DOCUMENT.xlsx"));
        assert!(done.notified);

        let failed = status_of(&pool, &bad.id);
        assert_eq!(failed.status, STATUS_FAILED);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_picks_up_submissions_and_stops_on_cancel() {
        let (_dir, pool, queue) = setup();
        let cancel = CancellationToken::new();
        let handle = consumer(pool.clone(), queue.clone(), Arc::new(RecordingNotifier::new()))
            .spawn(cancel.clone());

        let submitted = queue.submit(job(21), None).await.unwrap().job;
        let mut status = String::new();
        for _ in 0..100 {
            status = status_of(&pool, &submitted.id).status;
            if status == STATUS_SUCCEEDED {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, STATUS_SUCCEEDED);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("consumer stops")
            .unwrap();
    }
}
