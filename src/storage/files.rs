//! Local file-descriptor catalogue.
//!
//! One row per remote file id. Upserts are idempotent — re-applying the same
//! descriptor stream leaves the catalogue observationally identical (modulo
//! `synced_at`). The raw provider record is kept verbatim alongside the
//! projected columns so nothing is lost to the projection.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::provider::RemoteFile;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRow {
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub parent_id: Option<String>,
    pub modified_time: Option<String>,
    pub created_time: Option<String>,
    pub md5_checksum: Option<String>,
    pub synced_at: String,
    pub raw_metadata: String,
}

#[derive(Clone)]
pub struct FileStore {
    pool: SqlitePool,
}

impl FileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a batch of descriptors in one transaction.
    /// Last write wins on every column; `synced_at` is stamped per batch.
    pub async fn upsert_batch(&self, files: &[RemoteFile]) -> Result<u64> {
        if files.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for file in files {
            let raw = serde_json::to_string(file)?;
            sqlx::query(
                "INSERT INTO files
                   (id, name, mime_type, size, parent_id, modified_time,
                    created_time, md5_checksum, synced_at, raw_metadata)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                   name          = excluded.name,
                   mime_type     = excluded.mime_type,
                   size          = excluded.size,
                   parent_id     = excluded.parent_id,
                   modified_time = excluded.modified_time,
                   created_time  = excluded.created_time,
                   md5_checksum  = excluded.md5_checksum,
                   synced_at     = excluded.synced_at,
                   raw_metadata  = excluded.raw_metadata",
            )
            .bind(&file.id)
            .bind(&file.name)
            .bind(&file.mime_type)
            .bind(file.size)
            .bind(file.parents.first().map(|s| s.as_str()))
            .bind(&file.modified_time)
            .bind(&file.created_time)
            .bind(&file.md5_checksum)
            .bind(&now)
            .bind(&raw)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(files.len() as u64)
    }

    pub async fn get(&self, id: &str) -> Result<Option<FileRow>> {
        Ok(sqlx::query_as("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// List descriptors under a parent folder, name order.
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<FileRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM files WHERE parent_id = ? ORDER BY name ASC")
                .bind(parent_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Remove a descriptor. Used only when `purge_removed` is enabled.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
