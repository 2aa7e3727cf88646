pub mod config;
pub mod events;
pub mod jobs;
pub mod provider;
pub mod storage;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use config::SyncdConfig;
use events::EventBroadcaster;
use jobs::{JobRunner, JobStore, RunnerConfig};
use provider::{AuthorizedCaller, ProviderClient, ProviderConfig};
use storage::files::FileStore;
use storage::Storage;
use sync::{
    CheckpointStore, FullSyncHandler, IncrementalSyncHandler, SyncEngine, FULL_SYNC,
    INCREMENTAL_SYNC,
};

/// Shared application state: every store, the provider client, the runner,
/// and the sync engine, wired once and passed around as `Arc`s.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<SyncdConfig>,
    pub storage: Arc<Storage>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub job_store: Arc<JobStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub files: Arc<FileStore>,
    pub provider: Arc<ProviderClient>,
    pub runner: Arc<JobRunner>,
    pub engine: Arc<SyncEngine>,
}

impl AppContext {
    /// Wire all components over one storage pool and register the sync
    /// handlers. The caller is the already-authenticated HTTP boundary —
    /// production hands in a [`provider::HttpCaller`], tests a scripted one.
    pub async fn build(
        config: Arc<SyncdConfig>,
        storage: Arc<Storage>,
        caller: Arc<dyn AuthorizedCaller>,
    ) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let job_store = Arc::new(JobStore::new(storage.pool()));
        let checkpoints = Arc::new(CheckpointStore::new(storage.pool()));
        let files = Arc::new(FileStore::new(storage.pool()));

        let provider = Arc::new(ProviderClient::new(
            caller,
            ProviderConfig {
                page_size: config.page_size,
                max_retries: config.max_retries,
                retry_delay_ms: config.retry_delay_ms,
                ..ProviderConfig::default()
            },
        ));

        let runner = Arc::new(JobRunner::new(
            job_store.clone(),
            broadcaster.clone(),
            RunnerConfig {
                concurrency: config.concurrency,
                retry_delay_ms: config.retry_delay_ms,
                poll_interval: Duration::from_secs(1),
            },
        ));
        runner.register_handler(
            FULL_SYNC,
            Arc::new(FullSyncHandler::new(
                provider.clone(),
                checkpoints.clone(),
                files.clone(),
            )),
        ).await;
        runner.register_handler(
            INCREMENTAL_SYNC,
            Arc::new(IncrementalSyncHandler::new(
                provider.clone(),
                checkpoints.clone(),
                files.clone(),
                config.purge_removed,
            )),
        ).await;

        let engine = Arc::new(SyncEngine::new(
            job_store.clone(),
            checkpoints.clone(),
            provider.clone(),
            broadcaster.clone(),
        ));

        Self {
            config,
            storage,
            broadcaster,
            job_store,
            checkpoints,
            files,
            provider,
            runner,
            engine,
        }
    }
}
