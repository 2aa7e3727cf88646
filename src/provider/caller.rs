//! The authenticated HTTP caller the client wraps.
//!
//! Credential acquisition lives outside the core: by the time a caller is
//! handed to [`ProviderClient`](super::ProviderClient) it must already attach
//! whatever the provider needs. Tests substitute a scripted implementation.

use async_trait::async_trait;
use chrono::Utc;

use super::error::ProviderError;

/// Raw response surface the client classifies: status, retry hint, body.
#[derive(Debug, Clone)]
pub struct CallerResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, if the response carried one.
    pub retry_after: Option<std::time::Duration>,
    pub body: String,
}

impl CallerResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An already-authenticated GET-only caller against the provider API.
#[async_trait]
pub trait AuthorizedCaller: Send + Sync {
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<CallerResponse, ProviderError>;
}

/// Turn a `Retry-After` header value into a wait duration.
///
/// The provider normally sends a bare number of seconds; RFC 7231 also
/// permits an HTTP-date, which becomes the delay until that instant (zero
/// when it has already passed). Unparseable values yield `None` and the
/// caller falls back to its own delay.
pub fn parse_retry_after(header_value: &str) -> Option<std::time::Duration> {
    let value = header_value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(std::time::Duration::from_secs(secs));
    }
    let retry_at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delay = retry_at.with_timezone(&Utc) - Utc::now();
    Some(delay.to_std().unwrap_or(std::time::Duration::ZERO))
}

// ─── Reqwest implementation ───────────────────────────────────────────────────

/// Production caller: reqwest + bearer token against the provider base URL.
pub struct HttpCaller {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpCaller {
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }
}

#[async_trait]
impl AuthorizedCaller for HttpCaller {
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<CallerResponse, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(CallerResponse {
            status,
            retry_after,
            body,
        })
    }
}
