use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &str) -> anyhow::Result<DbPool> {
    // Every pooled connection gets the same pragmas; the consumer and the
    // intake routes write concurrently.
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
    });
    let pool = Pool::builder().max_size(4).build(manager)?;
    Ok(pool)
}

pub fn close_pool(pool: &DbPool) {
    if let Ok(conn) = pool.get() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)");
    }
}
