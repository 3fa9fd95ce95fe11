use backup_export::{BackupArtifacts, BackupJob};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use uuid::Uuid;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

// ── ExportJob ──

/// Ledger row. The submitted payload (with credentials) is never part of it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: String,
    pub tenant_id: i64,
    pub recipient_email: String,
    pub status: String,
    pub attempts: i64,
    pub worker_id: Option<String>,
    pub bucket: Option<String>,
    pub folder: Option<String>,
    pub document_key: Option<String>,
    pub archive_key: Option<String>,
    pub manifest_key: Option<String>,
    pub assets_total: Option<i64>,
    pub assets_archived: Option<i64>,
    pub notified: bool,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

/// A job taken off the queue by one worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub worker_id: String,
    pub attempts: i64,
    pub job: BackupJob,
}

impl ClaimedJob {
    pub fn lease(&self) -> Lease {
        Lease {
            id: self.id.clone(),
            worker_id: self.worker_id.clone(),
            attempt: self.attempts,
        }
    }
}

/// One claim of a job. A job requeued and claimed again gets a new lease,
/// and only the current lease may record the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub worker_id: String,
    pub attempt: i64,
}

/// Fixed-width UTC timestamps so text comparison matches time order.
pub fn timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now() -> String {
    timestamp(Utc::now())
}

fn row_to_job(row: &Row) -> rusqlite::Result<ExportJob> {
    Ok(ExportJob {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        recipient_email: row.get("recipient_email")?,
        status: row.get("status")?,
        attempts: row.get("attempts")?,
        worker_id: row.get("worker_id")?,
        bucket: row.get("bucket")?,
        folder: row.get("folder")?,
        document_key: row.get("document_key")?,
        archive_key: row.get("archive_key")?,
        manifest_key: row.get("manifest_key")?,
        assets_total: row.get("assets_total")?,
        assets_archived: row.get("assets_archived")?,
        notified: row.get::<_, i64>("notified")? != 0,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<ExportJob>> {
    let mut stmt = conn.prepare("SELECT * FROM export_jobs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_job(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_by_idempotency_key(conn: &Connection, key: &str) -> anyhow::Result<Option<ExportJob>> {
    let mut stmt = conn.prepare("SELECT * FROM export_jobs WHERE idempotency_key = ?")?;
    let mut rows = stmt.query_map(params![key], |row| row_to_job(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

/// Queue `job`. With an idempotency key already on record, returns the
/// existing row and `true` instead of inserting.
pub fn create(
    conn: &Connection,
    job: &BackupJob,
    idempotency_key: Option<&str>,
) -> anyhow::Result<(ExportJob, bool)> {
    let id = Uuid::new_v4().to_string();
    let now = now();
    let payload = serde_json::to_string(job)?;
    let inserted = conn.execute(
        "INSERT INTO export_jobs (id, idempotency_key, tenant_id, recipient_email, payload, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            id,
            idempotency_key,
            job.tenant_id,
            job.recipient_email.trim(),
            payload,
            STATUS_QUEUED,
            now,
            now,
        ],
    )?;

    if inserted == 0 {
        let key = idempotency_key
            .ok_or_else(|| anyhow::anyhow!("Insert ignored without an idempotency key"))?;
        let existing = find_by_idempotency_key(conn, key)?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve existing job"))?;
        return Ok((existing, true));
    }

    let created = find_by_id(conn, &id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created job"))?;
    Ok((created, false))
}

/// Atomically move the oldest queued job to `running` for `worker_id`.
/// Rows whose payload can't be read are failed on the spot.
pub fn claim_next(conn: &mut Connection, worker_id: &str) -> anyhow::Result<Option<ClaimedJob>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    loop {
        let next: Option<(String, Option<String>, i64)> = tx
            .query_row(
                "SELECT id, payload, attempts FROM export_jobs
                 WHERE status = ?1 ORDER BY created_at, rowid LIMIT 1",
                params![STATUS_QUEUED],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((id, payload, attempts)) = next else {
            tx.commit()?;
            return Ok(None);
        };

        let now = now();
        match payload.as_deref().map(serde_json::from_str::<BackupJob>) {
            Some(Ok(job)) => {
                tx.execute(
                    "UPDATE export_jobs SET status = ?1, attempts = attempts + 1, worker_id = ?2,
                     started_at = ?3, updated_at = ?3 WHERE id = ?4",
                    params![STATUS_RUNNING, worker_id, now, id],
                )?;
                tx.commit()?;
                return Ok(Some(ClaimedJob {
                    id,
                    worker_id: worker_id.to_string(),
                    attempts: attempts + 1,
                    job,
                }));
            }
            other => {
                let reason = match other {
                    Some(Err(e)) => format!("unreadable job payload: {}", e),
                    _ => "job payload missing".to_string(),
                };
                tracing::error!(job_id = %id, error = %reason, "dropping queued job");
                tx.execute(
                    "UPDATE export_jobs SET status = ?1, payload = NULL, error = ?2,
                     finished_at = ?3, updated_at = ?3 WHERE id = ?4",
                    params![STATUS_FAILED, reason, now, id],
                )?;
            }
        }
    }
}

/// Record a successful run. Returns `false` when `lease` is no longer the
/// job's current claim, in which case nothing is written.
pub fn mark_succeeded(
    conn: &Connection,
    lease: &Lease,
    artifacts: &BackupArtifacts,
    notified: bool,
) -> anyhow::Result<bool> {
    let now = now();
    let archive = artifacts.archive.as_ref();
    let changed = conn.execute(
        "UPDATE export_jobs SET status = ?1, payload = NULL, error = NULL, bucket = ?2, folder = ?3,
         document_key = ?4, archive_key = ?5, manifest_key = ?6, assets_total = ?7,
         assets_archived = ?8, notified = ?9, finished_at = ?10, updated_at = ?10
         WHERE id = ?11 AND status = ?12 AND worker_id = ?13 AND attempts = ?14",
        params![
            STATUS_SUCCEEDED,
            artifacts.bucket,
            artifacts.folder,
            artifacts.document_key,
            archive.and_then(|m| m.archive_key.clone()),
            artifacts.manifest_key,
            archive.map(|m| m.total as i64),
            archive.map(|m| m.archived as i64),
            notified as i64,
            now,
            lease.id,
            STATUS_RUNNING,
            lease.worker_id,
            lease.attempt,
        ],
    )?;
    Ok(changed == 1)
}

/// Record a failed run. Same lease rule as [`mark_succeeded`].
pub fn mark_failed(conn: &Connection, lease: &Lease, error: &str) -> anyhow::Result<bool> {
    let now = now();
    let changed = conn.execute(
        "UPDATE export_jobs SET status = ?1, payload = NULL, error = ?2, finished_at = ?3, updated_at = ?3
         WHERE id = ?4 AND status = ?5 AND worker_id = ?6 AND attempts = ?7",
        params![STATUS_FAILED, error, now, lease.id, STATUS_RUNNING, lease.worker_id, lease.attempt],
    )?;
    Ok(changed == 1)
}

/// Put jobs that have been `running` since before `lease` ago back on the
/// queue. Returns how many were requeued.
pub fn requeue_stale(conn: &Connection, lease: std::time::Duration) -> anyhow::Result<usize> {
    let lease = chrono::Duration::from_std(lease)?;
    let cutoff = timestamp(Utc::now() - lease);
    let changed = conn.execute(
        "UPDATE export_jobs SET status = ?1, worker_id = NULL, started_at = NULL, updated_at = ?2
         WHERE status = ?3 AND started_at < ?4",
        params![STATUS_QUEUED, now(), STATUS_RUNNING, cutoff],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_export::{ArchiveManifest, SourceConnection};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::db::migrate::SCHEMA).unwrap();
        conn
    }

    fn job(tenant_id: i64) -> BackupJob {
        BackupJob {
            tenant_id,
            recipient_email: "owner@clinic.test".into(),
            source_connection: SourceConnection {
                host: "db".into(),
                database: "clinic".into(),
                user: "ro".into(),
                password: "hunter2".into(),
            },
            destination_bucket: "exports".into(),
            destination_prefix: None,
            include_assets: false,
        }
    }

    #[test]
    fn test_duplicate_key_returns_existing_row() {
        let conn = conn();
        let (first, dup) = create(&conn, &job(21), Some("k1")).unwrap();
        assert!(!dup);
        let (second, dup) = create(&conn, &job(21), Some("k1")).unwrap();
        assert!(dup);
        assert_eq!(first.id, second.id);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM export_jobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let (third, dup) = create(&conn, &job(21), None).unwrap();
        assert!(!dup);
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn test_claims_are_exclusive_and_ordered() {
        let mut conn = conn();
        let (a, _) = create(&conn, &job(1), None).unwrap();
        let (b, _) = create(&conn, &job(2), None).unwrap();

        let first = claim_next(&mut conn, "w1").unwrap().unwrap();
        let second = claim_next(&mut conn, "w2").unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
        assert_eq!(first.job.source_connection.password, "hunter2");
        assert!(claim_next(&mut conn, "w3").unwrap().is_none());

        let row = find_by_id(&conn, &a.id).unwrap().unwrap();
        assert_eq!(row.status, STATUS_RUNNING);
        assert_eq!(row.worker_id.as_deref(), Some("w1"));
        assert_eq!(row.attempts, 1);
    }

    #[test]
    fn test_finishing_clears_the_payload() {
        let mut conn = conn();
        let (a, _) = create(&conn, &job(1), None).unwrap();
        let (b, _) = create(&conn, &job(2), None).unwrap();
        let first = claim_next(&mut conn, "w").unwrap().unwrap();
        let second = claim_next(&mut conn, "w").unwrap().unwrap();

        let artifacts = BackupArtifacts {
            bucket: "exports".into(),
            folder: "f".into(),
            document_key: "f/DOCUMENT.xlsx".into(),
            document_url: "http://x".into(),
            manifest_key: "f/README.txt".into(),
            archive: Some(ArchiveManifest { total: 4, archived: 3, archive_key: Some("f/ASSETS.zip".into()) }),
            archive_url: Some("http://y".into()),
        };
        assert!(mark_succeeded(&conn, &first.lease(), &artifacts, true).unwrap());
        assert!(mark_failed(&conn, &second.lease(), "Section source error (Patients): boom").unwrap());

        let done = find_by_id(&conn, &a.id).unwrap().unwrap();
        assert_eq!(done.status, STATUS_SUCCEEDED);
        assert_eq!(done.assets_archived, Some(3));
        assert_eq!(done.archive_key.as_deref(), Some("f/ASSETS.zip"));
        assert!(done.notified);

        let failed = find_by_id(&conn, &b.id).unwrap().unwrap();
        assert_eq!(failed.status, STATUS_FAILED);
        assert!(failed.error.unwrap().contains("Patients"));

        let payloads: i64 = conn
            .query_row("SELECT COUNT(*) FROM export_jobs WHERE payload IS NOT NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(payloads, 0);
    }

    #[test]
    fn test_stale_running_job_is_requeued() {
        let mut conn = conn();
        let (a, _) = create(&conn, &job(1), None).unwrap();
        claim_next(&mut conn, "crashed").unwrap();
        conn.execute(
            "UPDATE export_jobs SET started_at = ?1 WHERE id = ?2",
            params![timestamp(Utc::now() - chrono::Duration::hours(7)), a.id],
        )
        .unwrap();

        assert_eq!(requeue_stale(&conn, std::time::Duration::from_secs(3600)).unwrap(), 1);
        let again = claim_next(&mut conn, "w2").unwrap().unwrap();
        assert_eq!(again.id, a.id);
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn test_superseded_lease_cannot_record_an_outcome() {
        let mut conn = conn();
        let (a, _) = create(&conn, &job(1), None).unwrap();
        let slow = claim_next(&mut conn, "slow").unwrap().unwrap();
        conn.execute(
            "UPDATE export_jobs SET started_at = ?1 WHERE id = ?2",
            params![timestamp(Utc::now() - chrono::Duration::hours(7)), a.id],
        )
        .unwrap();
        requeue_stale(&conn, std::time::Duration::from_secs(3600)).unwrap();
        let current = claim_next(&mut conn, "fast").unwrap().unwrap();

        assert!(!mark_failed(&conn, &slow.lease(), "timed out").unwrap());
        let row = find_by_id(&conn, &a.id).unwrap().unwrap();
        assert_eq!(row.status, STATUS_RUNNING);
        assert_eq!(row.worker_id.as_deref(), Some("fast"));

        assert!(mark_failed(&conn, &current.lease(), "boom").unwrap());
        assert!(!mark_failed(&conn, &current.lease(), "boom again").unwrap());
        let row = find_by_id(&conn, &a.id).unwrap().unwrap();
        assert_eq!(row.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_same_worker_reclaim_supersedes_its_old_lease() {
        let mut conn = conn();
        let (a, _) = create(&conn, &job(1), None).unwrap();
        let old = claim_next(&mut conn, "w").unwrap().unwrap();
        conn.execute(
            "UPDATE export_jobs SET started_at = ?1 WHERE id = ?2",
            params![timestamp(Utc::now() - chrono::Duration::hours(7)), a.id],
        )
        .unwrap();
        requeue_stale(&conn, std::time::Duration::from_secs(3600)).unwrap();
        let new = claim_next(&mut conn, "w").unwrap().unwrap();
        assert_ne!(old.lease(), new.lease());
        assert!(!mark_failed(&conn, &old.lease(), "late").unwrap());
    }

    #[test]
    fn test_fresh_running_job_is_left_alone() {
        let mut conn = conn();
        create(&conn, &job(1), None).unwrap();
        claim_next(&mut conn, "w").unwrap();
        assert_eq!(requeue_stale(&conn, std::time::Duration::from_secs(3600)).unwrap(), 0);
    }

    #[test]
    fn test_unreadable_payload_is_failed_and_skipped() {
        let mut conn = conn();
        let (bad, _) = create(&conn, &job(1), None).unwrap();
        conn.execute("UPDATE export_jobs SET payload = '{' WHERE id = ?1", params![bad.id])
            .unwrap();
        let (good, _) = create(&conn, &job(2), None).unwrap();

        let claimed = claim_next(&mut conn, "w").unwrap().unwrap();
        assert_eq!(claimed.id, good.id);
        let bad = find_by_id(&conn, &bad.id).unwrap().unwrap();
        assert_eq!(bad.status, STATUS_FAILED);
    }
}
