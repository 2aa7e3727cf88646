//! Job handlers for the two sync modes.
//!
//! Both walk provider pages strictly sequentially and write the checkpoint
//! after every page, before the next page is requested. A crash between
//! pages therefore leaves the stored cursor pointing at work not yet done,
//! and a re-invocation with the same `sync_id` picks up exactly there.

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::jobs::{JobHandler, JobRow};
use crate::provider::ProviderClient;
use crate::storage::files::FileStore;
use crate::sync::checkpoint::{CheckpointRow, CheckpointStore};

#[derive(Debug, Deserialize)]
struct FullSyncPayload {
    sync_id: String,
    /// Advisory only — the stored checkpoint cursor wins.
    #[serde(default)]
    #[allow(dead_code)]
    resume_from: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncrementalSyncPayload {
    sync_id: String,
    #[serde(default)]
    start_page_token: Option<String>,
}

/// Load the checkpoint for a sync and flip it back to `in_progress` if a
/// previous attempt left it `failed`.
async fn load_checkpoint(checkpoints: &CheckpointStore, sync_id: &str) -> Result<CheckpointRow> {
    let checkpoint = checkpoints
        .find_by_sync_id(sync_id)
        .await?
        .ok_or_else(|| anyhow!("no checkpoint for sync '{sync_id}'"))?;
    if checkpoint.status == "failed" {
        checkpoints.resume(checkpoint.id).await?;
    }
    Ok(checkpoint)
}

// ─── Full sync ───────────────────────────────────────────────────────────────

/// Exhaustive page walk over the provider's current catalogue.
pub struct FullSyncHandler {
    provider: Arc<ProviderClient>,
    checkpoints: Arc<CheckpointStore>,
    files: Arc<FileStore>,
}

impl FullSyncHandler {
    pub fn new(
        provider: Arc<ProviderClient>,
        checkpoints: Arc<CheckpointStore>,
        files: Arc<FileStore>,
    ) -> Self {
        Self {
            provider,
            checkpoints,
            files,
        }
    }

    async fn page_loop(&self, checkpoint: &CheckpointRow) -> Result<i64> {
        // Resumption: trust the stored cursor and running count.
        let mut page_token = checkpoint.page_token.clone();
        let mut total = checkpoint.files_processed;

        loop {
            let page = self
                .provider
                .list_files(page_token.as_deref())
                .await
                .context("list files page")?;

            self.files.upsert_batch(&page.files).await?;
            total += page.files.len() as i64;
            page_token = page.next_page_token;

            // Durability anchor: persist the cursor before asking for more.
            self.checkpoints
                .update_progress(checkpoint.id, page_token.as_deref(), total)
                .await?;
            debug!(
                sync_id = %checkpoint.sync_id,
                total,
                next = ?page_token,
                "full sync page processed"
            );

            if page_token.is_none() {
                return Ok(total);
            }
        }
    }
}

#[async_trait]
impl JobHandler for FullSyncHandler {
    async fn run(&self, payload: serde_json::Value, _job: &JobRow) -> Result<()> {
        let payload: FullSyncPayload =
            serde_json::from_value(payload).context("full_sync payload")?;
        let checkpoint = load_checkpoint(&self.checkpoints, &payload.sync_id).await?;

        match self.page_loop(&checkpoint).await {
            Ok(total) => {
                self.checkpoints.mark_completed(checkpoint.id, total).await?;
                info!(sync_id = %payload.sync_id, files = total, "full sync completed");
                Ok(())
            }
            Err(e) => {
                self.checkpoints
                    .mark_failed(checkpoint.id, &format!("{e:#}"))
                    .await?;
                Err(e)
            }
        }
    }
}

// ─── Incremental sync ────────────────────────────────────────────────────────

/// Change-driven walk from a start cursor obtained in a prior sync.
pub struct IncrementalSyncHandler {
    provider: Arc<ProviderClient>,
    checkpoints: Arc<CheckpointStore>,
    files: Arc<FileStore>,
    /// Whether a change marked `removed` deletes the local descriptor.
    /// Off by default: descriptors are never purged unless the operator
    /// opts in.
    purge_removed: bool,
}

impl IncrementalSyncHandler {
    pub fn new(
        provider: Arc<ProviderClient>,
        checkpoints: Arc<CheckpointStore>,
        files: Arc<FileStore>,
        purge_removed: bool,
    ) -> Self {
        Self {
            provider,
            checkpoints,
            files,
            purge_removed,
        }
    }

    async fn change_loop(&self, checkpoint: &CheckpointRow, start_token: &str) -> Result<i64> {
        let mut cursor = checkpoint
            .page_token
            .clone()
            .unwrap_or_else(|| start_token.to_string());
        let mut total = checkpoint.files_processed;

        loop {
            let page = self
                .provider
                .list_changes(&cursor)
                .await
                .context("list changes page")?;

            let mut upserts = Vec::new();
            for change in &page.changes {
                if change.removed {
                    info!(file_id = %change.file_id, "file removed at provider");
                    if self.purge_removed {
                        self.files.delete(&change.file_id).await?;
                    }
                } else if let Some(file) = &change.file {
                    if !file.is_trashed() {
                        upserts.push(file.clone());
                    }
                }
            }
            self.files.upsert_batch(&upserts).await?;
            total += page.changes.len() as i64;

            // Mid-walk the next cursor continues this sync; the final page's
            // new start token is where the *next* incremental sync begins.
            let done = page.next_page_token.is_none();
            cursor = match page.next_page_token {
                Some(next) => next,
                None => page
                    .new_start_page_token
                    .ok_or_else(|| anyhow!("final change page carried no new start token"))?,
            };
            self.checkpoints
                .update_progress(checkpoint.id, Some(&cursor), total)
                .await?;
            debug!(
                sync_id = %checkpoint.sync_id,
                total,
                cursor = %cursor,
                "incremental sync page processed"
            );

            if done {
                return Ok(total);
            }
        }
    }
}

#[async_trait]
impl JobHandler for IncrementalSyncHandler {
    async fn run(&self, payload: serde_json::Value, _job: &JobRow) -> Result<()> {
        let payload: IncrementalSyncPayload =
            serde_json::from_value(payload).context("incremental_sync payload")?;
        let checkpoint = load_checkpoint(&self.checkpoints, &payload.sync_id).await?;

        let start_token = payload
            .start_page_token
            .clone()
            .or_else(|| checkpoint.page_token.clone())
            .ok_or_else(|| anyhow!("incremental sync '{}' has no cursor", payload.sync_id))?;

        match self.change_loop(&checkpoint, &start_token).await {
            Ok(total) => {
                self.checkpoints.mark_completed(checkpoint.id, total).await?;
                info!(sync_id = %payload.sync_id, changes = total, "incremental sync completed");
                Ok(())
            }
            Err(e) => {
                self.checkpoints
                    .mark_failed(checkpoint.id, &format!("{e:#}"))
                    .await?;
                Err(e)
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
