use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_CONCURRENCY: usize = 2;
const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_PROVIDER_BASE_URL: &str = "https://www.googleapis.com/drive/v3";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Maximum concurrently executing job handlers (default: 2).
    concurrency: Option<usize>,
    /// Descriptors requested per provider page (default: 100).
    page_size: Option<u32>,
    /// Provider retry budget per call (default: 5).
    max_retries: Option<u32>,
    /// Base delay in ms for exponential backoff (default: 1000).
    retry_delay_ms: Option<u64>,
    /// Override the provider API base URL.
    provider_base_url: Option<String>,
    /// Delete local descriptors when the provider reports them removed
    /// (default: false — removals are logged only).
    purge_removed: Option<bool>,
    /// Log level filter string, e.g. "debug", "info,syncd=trace" (default: "info").
    log: Option<String>,
}

impl TomlConfig {
    /// Read `{data_dir}/config.toml`. A missing file is the common case and
    /// yields defaults silently; a file that exists but does not parse is
    /// reported and then ignored rather than stopping startup.
    fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("config.toml");
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        toml::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), err = %e, "ignoring unparseable config.toml");
            Self::default()
        })
    }
}

// ─── SyncdConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncdConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// Maximum concurrently executing job handlers.
    pub concurrency: usize,
    /// Descriptors requested per provider page.
    pub page_size: u32,
    /// Provider retry budget per call.
    pub max_retries: u32,
    /// Base delay for exponential backoff (ms). Also the fallback rate-limit
    /// wait (`retry_delay_ms × 2`) when the server sends no hint.
    pub retry_delay_ms: u64,
    /// Provider API base URL (SYNCD_PROVIDER_URL env var overrides).
    pub provider_base_url: String,
    /// Delete local descriptors when the provider reports them removed.
    pub purge_removed: bool,
}

impl SyncdConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        data_dir: Option<PathBuf>,
        log: Option<String>,
        concurrency: Option<usize>,
        page_size: Option<u32>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = TomlConfig::load(&data_dir);

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let concurrency = concurrency
            .or(toml.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY)
            .max(1);
        let page_size = page_size
            .or(toml.page_size)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .max(1);
        let max_retries = toml.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let retry_delay_ms = toml.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS);

        let provider_base_url = std::env::var("SYNCD_PROVIDER_URL")
            .ok()
            .or(toml.provider_base_url)
            .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string());

        let purge_removed = toml.purge_removed.unwrap_or(false);

        Self {
            data_dir,
            log,
            concurrency,
            page_size,
            max_retries,
            retry_delay_ms,
            provider_base_url,
            purge_removed,
        }
    }
}

/// Platform data directory for the database and config file, falling back
/// to `./.syncd` when the usual environment variables are absent.
fn default_data_dir() -> PathBuf {
    let from_env = |var: &str| std::env::var_os(var).map(PathBuf::from);

    let base = if cfg!(target_os = "macos") {
        from_env("HOME").map(|home| home.join("Library").join("Application Support"))
    } else if cfg!(target_os = "windows") {
        from_env("APPDATA")
    } else {
        // XDG first, then the ~/.local/share convention it defaults to.
        from_env("XDG_DATA_HOME")
            .or_else(|| from_env("HOME").map(|home| home.join(".local").join("share")))
    };

    base.map(|dir| dir.join("syncd"))
        .unwrap_or_else(|| PathBuf::from(".syncd"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_without_toml() {
        let dir = TempDir::new().expect("tempdir");
        let config = SyncdConfig::new(Some(dir.path().to_path_buf()), None, None, None);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert!(!config.purge_removed);
        assert_eq!(config.log, "info");
    }

    #[test]
    fn toml_overrides_defaults_and_cli_overrides_toml() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("config.toml"),
            "concurrency = 8\npage_size = 50\npurge_removed = true\n",
        )
        .expect("write toml");

        let config = SyncdConfig::new(Some(dir.path().to_path_buf()), None, Some(4), None);
        // CLI wins over TOML for concurrency; TOML wins over defaults elsewhere.
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.page_size, 50);
        assert!(config.purge_removed);
    }

    #[test]
    fn zero_concurrency_clamped_to_one() {
        let dir = TempDir::new().expect("tempdir");
        let config = SyncdConfig::new(Some(dir.path().to_path_buf()), None, Some(0), None);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("config.toml"), "concurrency = \"lots\"")
            .expect("write toml");
        let config = SyncdConfig::new(Some(dir.path().to_path_buf()), None, None, None);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
    }
}
