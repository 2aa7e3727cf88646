//! Runner and queue behaviour over real storage: dispatch ordering, retry
//! accounting, and dead-letter escalation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use syncd::events::EventBroadcaster;
use syncd::jobs::{
    CreateJob, JobHandler, JobRow, JobRunner, JobStore, JobStatus, RunnerConfig,
};
use syncd::storage::Storage;
use tempfile::TempDir;
use tokio::sync::Mutex;

async fn setup(concurrency: usize) -> (Arc<JobRunner>, Arc<JobStore>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let storage = Storage::new(dir.path()).await.expect("storage");
    let store = Arc::new(JobStore::new(storage.pool()));
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        Arc::new(EventBroadcaster::new()),
        RunnerConfig {
            concurrency,
            retry_delay_ms: 1,
            poll_interval: Duration::from_millis(25),
        },
    ));
    (runner, store, dir)
}

/// Poll until `predicate` holds or ten seconds pass.
async fn wait_until<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 10s");
}

/// Records the payload tag of every invocation, in order.
struct RecordingHandler {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn run(&self, payload: Value, _job: &JobRow) -> Result<()> {
        let tag = payload["tag"].as_str().unwrap_or_default().to_string();
        self.seen.lock().await.push(tag);
        Ok(())
    }
}

#[tokio::test]
async fn priority_order_wins_then_fifo() {
    let (runner, store, _dir) = setup(1).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    runner.register_handler("ordered", Arc::new(RecordingHandler { seen: seen.clone() })).await;

    // Enqueued lowest-priority first; dispatch must invert that.
    for (tag, priority) in [("low", 1), ("mid", 5), ("high", 10)] {
        store
            .create(
                "ordered",
                &json!({"tag": tag}),
                CreateJob {
                    priority,
                    ..CreateJob::default()
                },
            )
            .await
            .expect("create");
    }

    runner.clone().start().await;
    wait_until(|| async { store.get_stats().await.unwrap().completed == 3 }).await;

    assert_eq!(*seen.lock().await, vec!["high", "mid", "low"]);
    runner.stop().await;
}

struct FailNThenSucceed {
    failures: AtomicU64,
    budget: u64,
}

#[async_trait]
impl JobHandler for FailNThenSucceed {
    async fn run(&self, _payload: Value, _job: &JobRow) -> Result<()> {
        if self.failures.fetch_add(1, Ordering::SeqCst) < self.budget {
            anyhow::bail!("not yet");
        }
        Ok(())
    }
}

#[tokio::test]
async fn retry_monotonicity_attempts_equals_failures_plus_one() {
    let (runner, store, _dir) = setup(1).await;
    runner.register_handler(
        "flaky",
        Arc::new(FailNThenSucceed {
            failures: AtomicU64::new(0),
            budget: 2,
        }),
    ).await;
    runner.clone().start().await;

    let job = store
        .create(
            "flaky",
            &json!({}),
            CreateJob {
                max_attempts: 5,
                ..CreateJob::default()
            },
        )
        .await
        .expect("create");
    wait_until(|| async {
        store.find_by_id(&job.id).await.unwrap().unwrap().status == "completed"
    })
    .await;

    let row = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(row.attempts, 3);
    assert!(row.attempts <= row.max_attempts);
    runner.stop().await;
}

struct AlwaysFail;

#[async_trait]
impl JobHandler for AlwaysFail {
    async fn run(&self, _payload: Value, _job: &JobRow) -> Result<()> {
        anyhow::bail!("handler always throws")
    }
}

#[tokio::test]
async fn dead_letter_escalation_after_two_attempts() {
    let (runner, store, _dir) = setup(1).await;
    runner.register_handler("doomed", Arc::new(AlwaysFail)).await;
    runner.clone().start().await;

    let job = store
        .create(
            "doomed",
            &json!({"payload": "snapshot"}),
            CreateJob {
                max_attempts: 2,
                ..CreateJob::default()
            },
        )
        .await
        .expect("create");
    wait_until(|| async { store.find_by_id(&job.id).await.unwrap().unwrap().status == "dead" })
        .await;

    let row = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(row.attempts, 2);

    let dead = store.get_dead_letter_jobs(10).await.expect("dead letters");
    assert_eq!(dead.len(), 1, "exactly one dead-letter row");
    assert_eq!(dead[0].job_id, job.id);
    assert_eq!(dead[0].payload, row.payload);
    runner.stop().await;
}

#[tokio::test]
async fn single_attempt_job_lands_directly_in_dead_letter() {
    let (runner, store, _dir) = setup(1).await;
    runner.register_handler("doomed", Arc::new(AlwaysFail)).await;
    runner.clone().start().await;

    let job = store
        .create(
            "doomed",
            &json!({}),
            CreateJob {
                max_attempts: 1,
                ..CreateJob::default()
            },
        )
        .await
        .expect("create");
    wait_until(|| async { store.find_by_id(&job.id).await.unwrap().unwrap().status == "dead" })
        .await;

    assert_eq!(store.get_dead_letter_jobs(10).await.unwrap().len(), 1);
    // Never passed through a reschedule.
    assert_eq!(
        store.find_by_id(&job.id).await.unwrap().unwrap().attempts,
        1
    );
    runner.stop().await;
}

#[tokio::test]
async fn dead_job_retried_by_operator_runs_again() {
    let (runner, store, _dir) = setup(1).await;
    // First life: always fails. The retried job finds a fixed handler —
    // registrations can be replaced between lives.
    runner.register_handler("flaky-type", Arc::new(AlwaysFail)).await;
    runner.clone().start().await;

    let job = store
        .create(
            "flaky-type",
            &json!({}),
            CreateJob {
                max_attempts: 1,
                ..CreateJob::default()
            },
        )
        .await
        .expect("create");
    wait_until(|| async { store.find_by_id(&job.id).await.unwrap().unwrap().status == "dead" })
        .await;

    runner.register_handler(
        "flaky-type",
        Arc::new(FailNThenSucceed {
            failures: AtomicU64::new(0),
            budget: 0,
        }),
    ).await;
    let dead = store.get_dead_letter_jobs(1).await.expect("dead letters");
    let revived = store.retry_dead_job(&dead[0].id).await.expect("retry");
    assert_eq!(revived.attempts, 0);

    wait_until(|| async {
        store.find_by_id(&job.id).await.unwrap().unwrap().status == "completed"
    })
    .await;
    assert!(store.get_dead_letter_jobs(10).await.unwrap().is_empty());
    runner.stop().await;
}

#[tokio::test]
async fn scheduled_jobs_wait_for_their_time() {
    let (runner, store, _dir) = setup(2).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    runner.register_handler("timed", Arc::new(RecordingHandler { seen: seen.clone() })).await;
    runner.clone().start().await;

    store
        .create(
            "timed",
            &json!({"tag": "later"}),
            CreateJob {
                scheduled_at: Some(chrono::Utc::now() + chrono::Duration::milliseconds(300)),
                ..CreateJob::default()
            },
        )
        .await
        .expect("create deferred");
    store
        .create("timed", &json!({"tag": "now"}), CreateJob::default())
        .await
        .expect("create immediate");

    wait_until(|| async { store.get_stats().await.unwrap().completed == 2 }).await;
    // The deferred job ran, but strictly after the immediate one.
    assert_eq!(*seen.lock().await, vec!["now", "later"]);
    runner.stop().await;
}

#[tokio::test]
async fn recover_stale_jobs_requeues_then_completes() {
    let dir = TempDir::new().expect("tempdir");
    let storage = Storage::new(dir.path()).await.expect("storage");
    let store = Arc::new(JobStore::new(storage.pool()));

    // Simulate a crash: a job claimed by a previous process, never finished.
    let job = store
        .create("work", &json!({}), CreateJob::default())
        .await
        .expect("create");
    store.mark_running(&job.id).await.expect("claim");

    // New process boots, sweeps, then runs.
    assert_eq!(store.recover_stale_jobs().await.expect("sweep"), 1);
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        Arc::new(EventBroadcaster::new()),
        RunnerConfig {
            concurrency: 1,
            retry_delay_ms: 1,
            poll_interval: Duration::from_millis(25),
        },
    ));
    runner.register_handler(
        "work",
        Arc::new(FailNThenSucceed {
            failures: AtomicU64::new(0),
            budget: 0,
        }),
    ).await;
    runner.clone().start().await;

    wait_until(|| async {
        store.find_by_id(&job.id).await.unwrap().unwrap().status == "completed"
    })
    .await;
    // The interrupted claim plus the successful run.
    assert_eq!(
        store.find_by_id(&job.id).await.unwrap().unwrap().attempts,
        2
    );
    runner.stop().await;

    let by_status = store
        .find_by_status(JobStatus::Completed, 10)
        .await
        .expect("by status");
    assert_eq!(by_status.len(), 1);
}
