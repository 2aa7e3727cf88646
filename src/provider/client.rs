// SPDX-License-Identifier: MIT
//! Rate-limit-aware provider client.
//!
//! Every request passes a spacing gate (minimum interval between any two
//! requests across the instance) and runs under `execute_with_retry`:
//! rate-limit responses honour the server's retry hint, transient server
//! failures back off exponentially with jitter, and anything else propagates
//! immediately. Callers above this layer never see a retryable failure until
//! the retry budget is spent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::caller::AuthorizedCaller;
use super::error::ProviderError;
use super::types::{ChangeList, FileList, StartPageToken, FILE_FIELDS};

/// Ceiling for the transient-failure backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Upper bound of the uniform jitter added to each backoff sleep.
const JITTER_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Descriptors per page requested from the provider.
    pub page_size: u32,
    /// Retry budget per call for rate-limit and server failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff, and the fallback rate-limit wait
    /// (`retry_delay_ms × 2`) when the server sends no hint.
    pub retry_delay_ms: u64,
    /// Minimum spacing between any two requests across the client instance.
    pub min_request_interval_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_retries: 5,
            retry_delay_ms: 1_000,
            min_request_interval_ms: 100,
        }
    }
}

/// Single point of contact with the remote file provider.
pub struct ProviderClient {
    caller: Arc<dyn AuthorizedCaller>,
    config: ProviderConfig,
    /// Spacing gate state. Held across the pre-request sleep so concurrent
    /// callers serialize on it — that is what makes the interval global.
    last_request: Mutex<Option<Instant>>,
    request_count: AtomicU64,
}

impl ProviderClient {
    pub fn new(caller: Arc<dyn AuthorizedCaller>, config: ProviderConfig) -> Self {
        Self {
            caller,
            config,
            last_request: Mutex::new(None),
            request_count: AtomicU64::new(0),
        }
    }

    /// Total requests issued by this instance, retries included.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    // ─── Read operations ─────────────────────────────────────────────────────

    /// List descriptors, one page at a time. Trashed entries are excluded.
    pub async fn list_files(&self, page_token: Option<&str>) -> Result<FileList, ProviderError> {
        let mut query: Vec<(&str, String)> = vec![
            ("pageSize", self.config.page_size.to_string()),
            ("q", "trashed = false".to_string()),
            ("fields", format!("nextPageToken,files({FILE_FIELDS})")),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let body = self.execute_with_retry("/files", &query).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// List change records from a cursor obtained via
    /// [`get_start_page_token`](Self::get_start_page_token) or a prior page.
    pub async fn list_changes(&self, page_token: &str) -> Result<ChangeList, ProviderError> {
        let query: Vec<(&str, String)> = vec![
            ("pageToken", page_token.to_string()),
            ("pageSize", self.config.page_size.to_string()),
            (
                "fields",
                format!("nextPageToken,newStartPageToken,changes(fileId,removed,file({FILE_FIELDS}))"),
            ),
        ];
        let body = self.execute_with_retry("/changes", &query).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Obtain the cursor marking "now" for a future incremental sync.
    pub async fn get_start_page_token(&self) -> Result<String, ProviderError> {
        let body = self
            .execute_with_retry("/changes/startPageToken", &[])
            .await?;
        let token: StartPageToken = serde_json::from_str(&body)?;
        Ok(token.start_page_token)
    }

    // ─── Throttling and retry ────────────────────────────────────────────────

    /// Wait until the spacing gate opens, then stamp this request's slot.
    async fn throttle(&self) {
        let interval = Duration::from_millis(self.config.min_request_interval_ms);
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Issue a GET under the retry policy and return the success body.
    async fn execute_with_retry(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<String, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            self.throttle().await;
            self.request_count.fetch_add(1, Ordering::Relaxed);

            let response = match self.caller.get(path, query).await {
                Ok(r) => r,
                // Connection-level failures are as transient as a 5xx.
                Err(ProviderError::Transport(msg)) if attempt < self.config.max_retries => {
                    warn!(path, attempt, err = %msg, "transport error, backing off");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if response.is_success() {
                return Ok(response.body);
            }

            match response.status {
                429 | 403 => {
                    let hint_ms = response
                        .retry_after
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(self.config.retry_delay_ms * 2);
                    if attempt >= self.config.max_retries {
                        return Err(ProviderError::RateLimited {
                            retry_after_ms: hint_ms,
                        });
                    }
                    warn!(path, attempt, hint_ms, "rate limited, waiting for hint");
                    tokio::time::sleep(Duration::from_millis(hint_ms)).await;
                }
                status if (500..600).contains(&status) => {
                    if attempt >= self.config.max_retries {
                        return Err(ProviderError::Server { status });
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(path, attempt, status, delay_ms = delay.as_millis() as u64, "server error, backing off");
                    tokio::time::sleep(delay).await;
                }
                status => {
                    return Err(ProviderError::Terminal {
                        status,
                        body: response.body,
                    });
                }
            }
            attempt += 1;
        }
    }

    /// `min(retry_delay_ms × 2^attempt, 60 s)` plus uniform jitter in [0, 1 s).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let raw = self
            .config
            .retry_delay_ms
            .saturating_mul(1u64 << attempt.min(63));
        let capped = Duration::from_millis(raw).min(MAX_BACKOFF);
        // Seed with the request counter so consecutive retries spread out.
        let seed = self.request_count.load(Ordering::Relaxed).wrapping_add(attempt as u64);
        capped + Duration::from_millis(pseudo_rand(seed, JITTER_MS))
    }
}

/// Produce a value in [0, max) using a simple LCG seeded by `seed`.
/// This avoids adding a `rand` dependency for a small jitter spread.
fn pseudo_rand(seed: u64, max: u64) -> u64 {
    // LCG parameters (Numerical Recipes)
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let state = A.wrapping_mul(seed).wrapping_add(C) % M;
    state * max / M
}
