use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS export_jobs (
  id TEXT PRIMARY KEY,
  idempotency_key TEXT UNIQUE,
  tenant_id INTEGER NOT NULL,
  recipient_email TEXT NOT NULL,
  payload TEXT,
  status TEXT NOT NULL DEFAULT 'queued' CHECK(status IN ('queued','running','succeeded','failed')),
  attempts INTEGER NOT NULL DEFAULT 0,
  worker_id TEXT,
  bucket TEXT,
  folder TEXT,
  document_key TEXT,
  archive_key TEXT,
  manifest_key TEXT,
  assets_total INTEGER,
  assets_archived INTEGER,
  notified INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  finished_at TEXT,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_export_jobs_status_created ON export_jobs(status, created_at);
"#;

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;

    #[test]
    fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");
        let pool = create_pool(&db_path.to_string_lossy()).unwrap();
        migrate(&pool, dir.path()).unwrap();
        migrate(&pool, dir.path()).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM export_jobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
