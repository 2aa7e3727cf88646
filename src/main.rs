use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use syncd::{
    config::SyncdConfig,
    provider::HttpCaller,
    storage::Storage,
    AppContext,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "syncd",
    about = "syncd — resumable, rate-limited cloud file metadata sync daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for the SQLite database and config.toml
    #[arg(long, env = "SYNCD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SYNCD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "SYNCD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Maximum concurrently executing job handlers
    #[arg(long, env = "SYNCD_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Descriptors requested per provider page
    #[arg(long, env = "SYNCD_PAGE_SIZE")]
    page_size: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync daemon in the foreground (default when no subcommand given).
    Serve {
        /// Kick off a full sync at startup (resumes an interrupted one if present)
        #[arg(long)]
        full_sync: bool,
    },
    /// Start, inspect, or control syncs.
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
    /// Inspect the job queue and dead letters.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Enqueue a full sync (a running daemon picks it up)
    Full,
    /// Enqueue an incremental sync from the last known cursor
    Incremental,
    /// Show one sync's checkpoint
    Status { sync_id: String },
    /// List recent syncs, most recent first
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Pause a sync (takes effect at the next sync start)
    Pause { sync_id: String },
    /// Resume a paused or failed sync from its stored cursor
    Resume { sync_id: String },
    /// Delete a finished sync's checkpoint
    Delete { sync_id: String },
}

#[derive(Subcommand)]
enum JobsAction {
    /// Per-status job counts plus dead-letter size
    Stats,
    /// List dead-letter entries
    DeadLetter {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Requeue a dead-lettered job with a fresh attempt budget
    Retry { dead_letter_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Logging setup ────────────────────────────────────────────────────────
    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let config = Arc::new(SyncdConfig::new(
        args.data_dir,
        args.log,
        args.concurrency,
        args.page_size,
    ));

    match args.command {
        None | Some(Command::Serve { full_sync: false }) => serve(config, false).await,
        Some(Command::Serve { full_sync: true }) => serve(config, true).await,
        Some(Command::Sync { action }) => run_sync_action(config, action).await,
        Some(Command::Jobs { action }) => run_jobs_action(config, action).await,
    }
}

/// Build the application context against the configured data directory.
async fn build_context(config: Arc<SyncdConfig>) -> Result<AppContext> {
    let storage = Arc::new(Storage::new(&config.data_dir).await?);
    let access_token = std::env::var("SYNCD_ACCESS_TOKEN")
        .context("SYNCD_ACCESS_TOKEN is not set — syncd needs an authenticated caller")?;
    let caller = Arc::new(HttpCaller::new(&config.provider_base_url, &access_token)?);
    Ok(AppContext::build(config, storage, caller).await)
}

async fn serve(config: Arc<SyncdConfig>, kick_full_sync: bool) -> Result<()> {
    let ctx = build_context(config).await?;

    // Jobs left `running` by a crashed process go back to pending before
    // the runner takes its first tick.
    let recovered = ctx.job_store.recover_stale_jobs().await?;
    if recovered > 0 {
        warn!(recovered, "requeued jobs stranded by a previous process");
    }

    ctx.runner.clone().start().await;
    info!(
        data_dir = %ctx.config.data_dir.display(),
        concurrency = ctx.config.concurrency,
        "syncd running"
    );

    if kick_full_sync {
        let checkpoint = ctx.engine.start_full_sync().await?;
        info!(sync_id = %checkpoint.sync_id, "startup full sync enqueued");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping dispatch");
    ctx.runner.stop().await;
    Ok(())
}

async fn run_sync_action(config: Arc<SyncdConfig>, action: SyncAction) -> Result<()> {
    let ctx = build_context(config).await?;
    match action {
        SyncAction::Full => {
            let checkpoint = ctx.engine.start_full_sync().await?;
            println!("full sync enqueued: {}", checkpoint.sync_id);
        }
        SyncAction::Incremental => {
            let checkpoint = ctx.engine.start_incremental_sync().await?;
            println!("incremental sync enqueued: {}", checkpoint.sync_id);
        }
        SyncAction::Status { sync_id } => {
            let checkpoint = ctx.engine.get_status(&sync_id).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        SyncAction::History { limit } => {
            for checkpoint in ctx.engine.get_sync_history(limit).await? {
                println!(
                    "{}  {:<12} files={:<8} updated={}",
                    checkpoint.sync_id,
                    checkpoint.status,
                    checkpoint.files_processed,
                    checkpoint.updated_at
                );
            }
        }
        SyncAction::Pause { sync_id } => {
            ctx.engine.pause_sync(&sync_id).await?;
            println!("paused: {sync_id}");
        }
        SyncAction::Resume { sync_id } => {
            ctx.engine.resume_sync(&sync_id).await?;
            println!("resumed: {sync_id}");
        }
        SyncAction::Delete { sync_id } => {
            ctx.engine.delete_sync(&sync_id).await?;
            println!("deleted: {sync_id}");
        }
    }
    Ok(())
}

async fn run_jobs_action(config: Arc<SyncdConfig>, action: JobsAction) -> Result<()> {
    let ctx = build_context(config).await?;
    match action {
        JobsAction::Stats => {
            let stats = ctx.job_store.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        JobsAction::DeadLetter { limit } => {
            for entry in ctx.job_store.get_dead_letter_jobs(limit).await? {
                println!(
                    "{}  job={} type={} failed_at={} error={}",
                    entry.id, entry.job_id, entry.job_type, entry.failed_at, entry.error_message
                );
            }
        }
        JobsAction::Retry { dead_letter_id } => {
            let job = ctx.job_store.retry_dead_job(&dead_letter_id).await?;
            println!("requeued job {} ({})", job.id, job.job_type);
        }
    }
    Ok(())
}

/// Install the global tracing subscriber.
///
/// Logs always go to stdout; with `log_file` set they are mirrored to a
/// daily-rolled file as well. The returned guard must live for the whole
/// process so buffered file writes flush on exit.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let stdout = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact());

    match log_file.and_then(open_rolling_log) {
        Some((writer, guard)) => {
            stdout
                .with(tracing_subscriber::fmt::layer().with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            stdout.init();
            None
        }
    }
}

/// Open a daily-rolling appender at `path`, creating its directory first.
/// A bad log path must not stop the daemon, so failure degrades to stdout
/// only, with a note on stderr.
fn open_rolling_log(
    path: &std::path::Path,
) -> Option<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => std::path::Path::new("."),
    };
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "warn: cannot create log directory '{}': {e}; logging to stdout only",
            dir.display()
        );
        return None;
    }
    let filename = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("syncd.log"));
    Some(tracing_appender::non_blocking(
        tracing_appender::rolling::daily(dir, filename),
    ))
}
