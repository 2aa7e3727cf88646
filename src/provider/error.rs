use thiserror::Error;

/// Failure classification for provider calls.
///
/// `RateLimited` and `Server` are retried inside the client up to
/// `max_retries`; `Terminal` propagates immediately. Whatever escapes here is
/// a normal job failure from the runner's point of view.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 429 / 403 after exhausting retries. Carries the last server hint.
    #[error("rate limited by provider (retry hint {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    /// 5xx after exhausting retries.
    #[error("provider server error: HTTP {status}")]
    Server { status: u16 },

    /// Any other non-success response — not retryable.
    #[error("provider rejected request: HTTP {status}: {body}")]
    Terminal { status: u16, body: String },

    /// Network / connection failure from the underlying caller.
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body did not match the expected shape.
    #[error("malformed provider response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ProviderError {
    /// True for failures the client will retry internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Server { .. }
        )
    }
}
