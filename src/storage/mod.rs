pub mod files;

use anyhow::{anyhow, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;

/// Budget for any single SQLite query; a wedged statement fails instead of
/// hanging the daemon.
pub(crate) const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Run `fut` under [`QUERY_TIMEOUT`].
pub(crate) async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(QUERY_TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| Err(anyhow!("query exceeded {}s budget", QUERY_TIMEOUT.as_secs())))
}

/// Owns the SQLite connection pool shared by every durable store
/// (jobs, checkpoints, file catalogue).
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if needed) `{data_dir}/syncd.db` and bring its schema
    /// up to date. WAL journaling keeps checkpoint writes crash-safe without
    /// serializing readers behind the runner's writes.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let opts = SqliteConnectOptions::new()
            .filename(data_dir.join("syncd.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    /// Used by JobStore / CheckpointStore / FileStore to share one connection.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            sqlx::raw_sql(sql).execute(pool).await?;
        }
        Ok(())
    }
}
