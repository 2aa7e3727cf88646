//! Durable per-sync progress markers.
//!
//! One row per `sync_id`: the last observed page cursor, a running count of
//! processed descriptors, and the terminal status. The cursor written after
//! page N is the durability anchor — a crash between pages leaves the row
//! pointing at a cursor that has not yet been consumed.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::fmt;

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CheckpointRow {
    pub id: i64,
    pub sync_id: String,
    pub page_token: Option<String>,
    pub files_processed: i64,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an `in_progress` checkpoint for a new sync.
    pub async fn create(&self, sync_id: &str) -> Result<CheckpointRow> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sync_checkpoints
               (sync_id, page_token, files_processed, status, started_at, updated_at)
             VALUES (?, NULL, 0, 'in_progress', ?, ?)",
        )
        .bind(sync_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.find_by_sync_id(sync_id)
            .await?
            .ok_or_else(|| anyhow!("checkpoint not found after insert"))
    }

    pub async fn find_by_sync_id(&self, sync_id: &str) -> Result<Option<CheckpointRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM sync_checkpoints WHERE sync_id = ?")
                .bind(sync_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Most recently created `in_progress` checkpoint, if any.
    pub async fn find_latest_in_progress(&self) -> Result<Option<CheckpointRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM sync_checkpoints
             WHERE status = 'in_progress'
             ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Record one processed page: the next cursor plus the running count.
    /// `files_processed` never decreases, whatever the caller passes.
    pub async fn update_progress(
        &self,
        id: i64,
        page_token: Option<&str>,
        files_processed: i64,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sync_checkpoints
             SET page_token = ?, files_processed = MAX(files_processed, ?), updated_at = ?
             WHERE id = ?",
        )
        .bind(page_token)
        .bind(files_processed)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: i64, files_processed: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sync_checkpoints
             SET status = 'completed', files_processed = MAX(files_processed, ?),
                 completed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(files_processed)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sync_checkpoints
             SET status = 'failed', error_message = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pause(&self, id: i64) -> Result<()> {
        self.set_status(id, CheckpointStatus::Paused).await
    }

    /// Flip back to `in_progress` (resume, or a retry attempt starting over
    /// after a recorded failure).
    pub async fn resume(&self, id: i64) -> Result<()> {
        self.set_status(id, CheckpointStatus::InProgress).await
    }

    async fn set_status(&self, id: i64, status: CheckpointStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sync_checkpoints SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, sync_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_checkpoints WHERE sync_id = ?")
            .bind(sync_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sync history, most recent first.
    pub async fn get_history(&self, limit: i64) -> Result<Vec<CheckpointRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM sync_checkpoints ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::TempDir;

    async fn test_store() -> (CheckpointStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        (CheckpointStore::new(storage.pool()), dir)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let (store, _dir) = test_store().await;
        let cp = store.create("sync-1").await.expect("create");
        assert_eq!(cp.status, "in_progress");
        assert_eq!(cp.files_processed, 0);
        assert!(cp.page_token.is_none());

        let found = store
            .find_by_sync_id("sync-1")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, cp.id);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (store, _dir) = test_store().await;
        let cp = store.create("sync-1").await.expect("create");

        store
            .update_progress(cp.id, Some("p2"), 100)
            .await
            .expect("first update");
        // A stale writer with a smaller count cannot move the needle back.
        store
            .update_progress(cp.id, Some("p3"), 40)
            .await
            .expect("stale update");

        let row = store.find_by_sync_id("sync-1").await.unwrap().unwrap();
        assert_eq!(row.files_processed, 100);
        assert_eq!(row.page_token.as_deref(), Some("p3"));
    }

    #[tokio::test]
    async fn test_latest_in_progress_skips_completed() {
        let (store, _dir) = test_store().await;
        let first = store.create("sync-1").await.expect("create first");
        store.mark_completed(first.id, 5).await.expect("complete");
        let second = store.create("sync-2").await.expect("create second");

        let latest = store
            .find_latest_in_progress()
            .await
            .expect("query")
            .expect("present");
        assert_eq!(latest.sync_id, second.sync_id);

        store.mark_completed(second.id, 1).await.expect("complete");
        assert!(store.find_latest_in_progress().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (store, _dir) = test_store().await;
        let cp = store.create("sync-1").await.expect("create");

        store.pause(cp.id).await.expect("pause");
        let row = store.find_by_sync_id("sync-1").await.unwrap().unwrap();
        assert_eq!(row.status, "paused");

        store.resume(cp.id).await.expect("resume");
        let row = store.find_by_sync_id("sync-1").await.unwrap().unwrap();
        assert_eq!(row.status, "in_progress");
    }

    #[tokio::test]
    async fn test_mark_failed_records_error() {
        let (store, _dir) = test_store().await;
        let cp = store.create("sync-1").await.expect("create");
        store.mark_failed(cp.id, "provider 500").await.expect("fail");

        let row = store.find_by_sync_id("sync-1").await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_message.as_deref(), Some("provider 500"));
    }

    #[tokio::test]
    async fn test_history_most_recent_first() {
        let (store, _dir) = test_store().await;
        store.create("sync-1").await.expect("one");
        store.create("sync-2").await.expect("two");
        store.create("sync-3").await.expect("three");

        let history = store.get_history(2).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sync_id, "sync-3");
        assert_eq!(history[1].sync_id, "sync-2");
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _dir) = test_store().await;
        store.create("sync-1").await.expect("create");
        assert!(store.delete("sync-1").await.expect("delete"));
        assert!(!store.delete("sync-1").await.expect("delete missing"));
    }
}
