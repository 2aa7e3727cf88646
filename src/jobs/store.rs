// SPDX-License-Identifier: MIT
//! Durable job queue over SQLite.
//!
//! The store owns every legal state transition:
//!
//! ```text
//! pending --mark_running--> running --mark_completed--> completed
//!                              |
//!                              +--mark_failed (attempts < max)--> failed --reschedule--> pending
//!                              +--mark_failed (attempts >= max)-> dead   --retry_dead_job--> pending
//! ```
//!
//! Transitions are guarded UPDATEs (status must match the source state), so a
//! second caller racing on the same row simply loses the claim. The
//! dead-letter insert commits in the same transaction as the `dead` flip.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::storage::with_timeout;

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(anyhow!("'{other}' is not a job status")),
        }
    }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct JobRow {
    pub id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: String,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub scheduled_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl JobRow {
    /// Decode the payload JSON. The blob is preserved verbatim across
    /// restarts, so this never loses fields the creator wrote.
    pub fn payload_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or_default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DeadLetterRow {
    pub id: String,
    pub job_id: String,
    pub job_type: String,
    pub payload: String,
    pub error_message: String,
    pub failed_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub dead_letter: u64,
}

/// Creation options; the defaults match an ordinary background job.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub priority: i64,
    pub max_attempts: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Default for CreateJob {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 3,
            scheduled_at: None,
        }
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
        opts: CreateJob,
    ) -> Result<JobRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let scheduled = opts.scheduled_at.unwrap_or(now).to_rfc3339();
        let now = now.to_rfc3339();
        sqlx::query(
            "INSERT INTO jobs
               (id, type, payload, status, priority, attempts, max_attempts,
                created_at, updated_at, scheduled_at)
             VALUES (?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(job_type)
        .bind(serde_json::to_string(payload)?)
        .bind(opts.priority)
        .bind(opts.max_attempts)
        .bind(&now)
        .bind(&now)
        .bind(&scheduled)
        .execute(&self.pool)
        .await?;

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| anyhow!("job not found after insert"))
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<JobRow>> {
        Ok(sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Dispatch selection: pending rows whose `scheduled_at` has passed,
    /// highest priority first, FIFO within a priority tier.
    pub async fn find_pending_jobs(&self, limit: i64) -> Result<Vec<JobRow>> {
        let now = Utc::now().to_rfc3339();
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM jobs
                 WHERE status = 'pending' AND scheduled_at <= ?
                 ORDER BY priority DESC, created_at ASC
                 LIMIT ?",
            )
            .bind(&now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    pub async fn find_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<JobRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM jobs WHERE status = ? ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    // ─── Transitions ─────────────────────────────────────────────────────────

    /// Atomic claim: pending → running, counting the start as an attempt.
    /// Returns `false` if another runner (or a non-pending state) beat us.
    pub async fn mark_running(&self, id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'running', attempts = attempts + 1,
                 started_at = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// running → completed.
    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'completed', completed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("job {id} is not running"));
        }
        Ok(())
    }

    /// running → failed, or running → dead once the attempt budget is spent.
    /// The dead-letter append commits atomically with the `dead` flip.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<JobStatus> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let job: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let job = job.ok_or_else(|| anyhow!("job {id} not found"))?;
        if job.status != "running" {
            return Err(anyhow!("job {id} is not running (status: {})", job.status));
        }

        let exhausted = job.attempts >= job.max_attempts;
        let new_status = if exhausted {
            JobStatus::Dead
        } else {
            JobStatus::Failed
        };

        sqlx::query("UPDATE jobs SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(new_status.as_str())
            .bind(error)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if exhausted {
            sqlx::query(
                "INSERT INTO dead_letter_queue
                   (id, job_id, job_type, payload, error_message, failed_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&job.id)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(error)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(new_status)
    }

    /// failed → pending, eligible again after `delay_ms`.
    pub async fn reschedule(&self, id: &str, delay_ms: u64) -> Result<()> {
        let now = Utc::now();
        let scheduled = (now + Duration::milliseconds(delay_ms as i64)).to_rfc3339();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'pending', scheduled_at = ?, updated_at = ?
             WHERE id = ? AND status = 'failed'",
        )
        .bind(&scheduled)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("job {id} is not failed"));
        }
        Ok(())
    }

    // ─── Dead letters ────────────────────────────────────────────────────────

    pub async fn get_dead_letter_jobs(&self, limit: i64) -> Result<Vec<DeadLetterRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM dead_letter_queue ORDER BY failed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Operator-initiated retry: remove the dead-letter row and requeue the
    /// job with a fresh attempt budget.
    pub async fn retry_dead_job(&self, dead_letter_id: &str) -> Result<JobRow> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let entry: Option<DeadLetterRow> =
            sqlx::query_as("SELECT * FROM dead_letter_queue WHERE id = ?")
                .bind(dead_letter_id)
                .fetch_optional(&mut *tx)
                .await?;
        let entry = entry.ok_or_else(|| anyhow!("dead-letter entry {dead_letter_id} not found"))?;

        sqlx::query("DELETE FROM dead_letter_queue WHERE id = ?")
            .bind(dead_letter_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'pending', attempts = 0, last_error = NULL,
                 scheduled_at = ?, updated_at = ?
             WHERE id = ? AND status = 'dead'",
        )
        .bind(&now)
        .bind(&now)
        .bind(&entry.job_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("job {} is not dead", entry.job_id));
        }

        tx.commit().await?;
        self.find_by_id(&entry.job_id)
            .await?
            .ok_or_else(|| anyhow!("job {} vanished after retry", entry.job_id))
    }

    // ─── Statistics & recovery ───────────────────────────────────────────────

    pub async fn get_stats(&self) -> Result<JobStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = JobStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.as_str() {
                "pending" => stats.pending = count,
                "running" => stats.running = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "dead" => stats.dead = count,
                _ => {}
            }
        }
        let (dead_letter,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(&self.pool)
            .await?;
        stats.dead_letter = dead_letter as u64;
        Ok(stats)
    }

    /// Startup sweep: jobs left in `running` by a crashed process go back to
    /// `pending` immediately. Attempts are preserved, so `max_attempts` still
    /// bounds the total retries. Returns the number of rows recovered.
    pub async fn recover_stale_jobs(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', scheduled_at = ?, updated_at = ?
             WHERE status = 'running'",
        )
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
