// SPDX-License-Identifier: MIT
//! Poll-loop job runner.
//!
//! Wakes every `poll_interval` (1 s in production), claims up to
//! `concurrency − active` eligible jobs from the store, and dispatches each
//! to its registered handler on its own task. Failed handlers are retried
//! with exponential backoff (`retry_delay_ms × 2^attempts`, uncapped — jitter
//! is the provider client's concern) until the store escalates the job to the
//! dead-letter queue.
//!
//! Pause stops dispatch, never in-flight handlers. Stop halts polling and
//! lets active handlers drain; handlers abandoned at process exit re-surface
//! as `running` rows and are swept back to `pending` on the next boot.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::events::EventBroadcaster;
use crate::jobs::store::{JobRow, JobStats, JobStatus, JobStore};

/// A unit of work registered under a job type.
///
/// Handlers are expected to be long-running and are never cancelled by the
/// runner; errors bubble out so the runner can account for them.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: serde_json::Value, job: &JobRow) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Upper bound on concurrently executing handlers.
    pub concurrency: usize,
    /// Base for the retry backoff (`retry_delay_ms × 2^attempts`).
    pub retry_delay_ms: u64,
    /// Poll tick. Fixed at 1 s in production; tests shorten it.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            retry_delay_ms: 1_000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// In-memory view of one dispatched job.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub started_at: String,
}

/// Runner state merged with store counts for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStats {
    pub running: bool,
    pub paused: bool,
    pub active: usize,
    pub concurrency: usize,
    pub jobs: JobStats,
}

pub struct JobRunner {
    store: Arc<JobStore>,
    broadcaster: Arc<EventBroadcaster>,
    config: RunnerConfig,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    /// Jobs currently executing, keyed by job id. Mutated only on dispatch
    /// and on handler completion.
    active: Arc<Mutex<HashMap<String, ActiveJob>>>,
    running: AtomicBool,
    paused: AtomicBool,
    concurrency: AtomicUsize,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        broadcaster: Arc<EventBroadcaster>,
        config: RunnerConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            store,
            broadcaster,
            config,
            handlers: RwLock::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            concurrency: AtomicUsize::new(concurrency),
            poll_task: Mutex::new(None),
        }
    }

    /// Register a handler for a job type. Later registrations win.
    pub async fn register_handler(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .await
            .insert(job_type.to_string(), handler);
    }

    async fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(job_type).cloned()
    }

    // ─── Controls ────────────────────────────────────────────────────────────

    /// Start the poll loop. Idempotent — a second call is a no-op.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            concurrency = self.concurrency.load(Ordering::Relaxed),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "job runner starting"
        );
        let runner = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runner.config.poll_interval);
            loop {
                ticker.tick().await;
                if !runner.running.load(Ordering::SeqCst) {
                    break;
                }
                if runner.paused.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = JobRunner::dispatch_tick(&runner).await {
                    warn!(err = %e, "dispatch tick failed");
                }
            }
        });
        *self.poll_task.lock().await = Some(handle);
    }

    /// Halt polling. In-flight handlers keep running and drain naturally.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }
        info!("job runner stopped polling");
    }

    /// Suspend dispatch. In-flight jobs continue.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("job runner paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("job runner resumed");
    }

    /// Update the concurrency bound. Lowering it never cancels jobs — the
    /// excess drains as handlers finish.
    pub fn set_concurrency(&self, n: usize) {
        self.concurrency.store(n.max(1), Ordering::SeqCst);
    }

    pub async fn get_active_jobs(&self) -> Vec<ActiveJob> {
        self.active.lock().await.values().cloned().collect()
    }

    pub async fn get_stats(&self) -> Result<RunnerStats> {
        Ok(RunnerStats {
            running: self.running.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            active: self.active.lock().await.len(),
            concurrency: self.concurrency.load(Ordering::SeqCst),
            jobs: self.store.get_stats().await?,
        })
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    async fn dispatch_tick(runner: &Arc<JobRunner>) -> Result<()> {
        let active_count = runner.active.lock().await.len();
        let bound = runner.concurrency.load(Ordering::SeqCst);
        let capacity = bound.saturating_sub(active_count);
        if capacity == 0 {
            return Ok(());
        }

        let jobs = runner.store.find_pending_jobs(capacity as i64).await?;
        for job in jobs {
            // Claim before dispatch; a lost claim means the row changed under us.
            if !runner.store.mark_running(&job.id).await? {
                continue;
            }
            let entry = ActiveJob {
                id: job.id.clone(),
                job_type: job.job_type.clone(),
                started_at: chrono::Utc::now().to_rfc3339(),
            };
            runner.active.lock().await.insert(job.id.clone(), entry);
            runner.broadcaster.broadcast(
                "job.started",
                json!({ "job_id": job.id, "type": job.job_type }),
            );

            let worker = Arc::clone(runner);
            tokio::spawn(async move {
                worker.process(job).await;
            });
        }
        Ok(())
    }

    /// Run one claimed job to an outcome and record it.
    /// The active-map removal happens whether the handler returned or failed.
    async fn process(&self, job: JobRow) {
        let outcome = match self.handler_for(&job.job_type).await {
            Some(handler) => handler.run(job.payload_value(), &job).await,
            None => Err(anyhow::anyhow!(
                "no handler registered for job type '{}'",
                job.job_type
            )),
        };

        if let Err(e) = self.record_outcome(&job, outcome).await {
            error!(job_id = %job.id, err = %e, "failed to record job outcome");
        }
        self.active.lock().await.remove(&job.id);
    }

    async fn record_outcome(&self, job: &JobRow, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => {
                self.store.mark_completed(&job.id).await?;
                info!(job_id = %job.id, job_type = %job.job_type, "job completed");
                self.broadcaster.broadcast(
                    "job.completed",
                    json!({ "job_id": job.id, "type": job.job_type }),
                );
            }
            Err(e) => {
                let err = format!("{e:#}");
                // Re-read for the latest attempt count — the row may have
                // moved since this handler claimed it.
                let fresh = self
                    .store
                    .find_by_id(&job.id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("job {} vanished", job.id))?;

                let status = self.store.mark_failed(&job.id, &err).await?;
                match status {
                    JobStatus::Failed => {
                        let delay_ms = self
                            .config
                            .retry_delay_ms
                            .saturating_mul(1u64 << fresh.attempts.clamp(0, 63) as u32);
                        self.store.reschedule(&job.id, delay_ms).await?;
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempts = fresh.attempts,
                            delay_ms,
                            err = %err,
                            "job failed, retry scheduled"
                        );
                        self.broadcaster.broadcast(
                            "job.retry",
                            json!({
                                "job_id": job.id,
                                "type": job.job_type,
                                "error": err,
                                "attempts": fresh.attempts,
                                "delay_ms": delay_ms,
                            }),
                        );
                    }
                    _ => {
                        error!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempts = fresh.attempts,
                            err = %err,
                            "job exhausted retries, moved to dead letter"
                        );
                        self.broadcaster.broadcast(
                            "job.failed",
                            json!({ "job_id": job.id, "type": job.job_type, "error": err }),
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
