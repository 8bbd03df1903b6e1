use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::traversal::{CancelMode, QueryPolicy, TraversalOptions};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fhirgraph: FhirgraphConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub traversal: TraversalConfig,
}

/// Local storage and logging
#[derive(Debug, Clone, Deserialize)]
pub struct FhirgraphConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for FhirgraphConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
        }
    }
}

/// FHIR server connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the FHIR server; the CLI flag / FHIR_BASE env var wins when set.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Traversal limits and query policy
#[derive(Debug, Clone, Deserialize)]
pub struct TraversalConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_batch_chunk_size")]
    pub batch_chunk_size: usize,
    #[serde(default = "default_dedupe_values")]
    pub dedupe_values: bool,
    #[serde(default)]
    pub cancel_mode: CancelMode,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_pages: default_max_pages(),
            max_concurrency: default_max_concurrency(),
            batch_chunk_size: default_batch_chunk_size(),
            dedupe_values: default_dedupe_values(),
            cancel_mode: CancelMode::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/tmp/fhir-graph.sqlite")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_max_depth() -> usize {
    32
}

fn default_max_pages() -> usize {
    100
}

fn default_max_concurrency() -> usize {
    10
}

fn default_batch_chunk_size() -> usize {
    50
}

fn default_dedupe_values() -> bool {
    true
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in FHIRGRAPH_CONFIG environment variable
    /// 2. ./config.toml in current directory (optional, defaults apply when absent)
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config = match std::env::var("FHIRGRAPH_CONFIG") {
            Ok(path) => Self::from_path(Path::new(&path))?,
            Err(_) => {
                let path = PathBuf::from("config.toml");
                if path.exists() {
                    Self::from_path(&path)?
                } else {
                    log::debug!("No config.toml found, using defaults");
                    Config::default()
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file without validating it
    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if let Some(base_url) = &self.server.base_url {
            let parsed = url::Url::parse(base_url)
                .with_context(|| format!("server.base_url is not a valid URL: {}", base_url))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                anyhow::bail!("server.base_url must be http(s): {}", base_url);
            }
        }

        if self.traversal.max_pages == 0 {
            anyhow::bail!("traversal.max_pages must be greater than 0");
        }

        if self.traversal.max_concurrency == 0 {
            anyhow::bail!("traversal.max_concurrency must be greater than 0");
        }

        if self.traversal.batch_chunk_size == 0 {
            anyhow::bail!("traversal.batch_chunk_size must be greater than 0");
        }

        Ok(())
    }

    /// Get result database path
    pub fn db_path(&self) -> &Path {
        &self.fhirgraph.db_path
    }

    /// Build traversal options from the `[traversal]` section (fresh cancellation token)
    pub fn traversal_options(&self) -> TraversalOptions {
        TraversalOptions {
            max_depth: self.traversal.max_depth,
            max_pages: self.traversal.max_pages,
            max_concurrency: self.traversal.max_concurrency,
            cancel_mode: self.traversal.cancel_mode,
            query_policy: QueryPolicy {
                dedupe_values: self.traversal.dedupe_values,
                batch_chunk_size: self.traversal.batch_chunk_size,
            },
            ..TraversalOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const TEST_CONFIG: &str = r#"
[fhirgraph]
db_path = "./graph.sqlite"
log_level = "debug"

[server]
base_url = "https://fhir.example.org/R5"
timeout_secs = 30
max_retries = 1

[traversal]
max_depth = 4
max_pages = 7
batch_chunk_size = 20
dedupe_values = false
cancel_mode = "abandon"
"#;

    fn with_config_env(config_path: &Path, f: impl FnOnce()) {
        let original = std::env::var("FHIRGRAPH_CONFIG").ok();
        std::env::set_var("FHIRGRAPH_CONFIG", config_path);
        f();
        std::env::remove_var("FHIRGRAPH_CONFIG");
        if let Some(val) = original {
            std::env::set_var("FHIRGRAPH_CONFIG", val);
        }
    }

    #[test]
    fn test_config_load_success() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, TEST_CONFIG).unwrap();
        with_config_env(&config_path, || {
            let config = Config::load();
            assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
            let config = config.unwrap();
            assert_eq!(config.fhirgraph.log_level, "debug");
            assert_eq!(config.server.timeout_secs, 30);
            assert_eq!(config.server.connect_timeout_secs, 60);
            assert_eq!(config.traversal.max_pages, 7);
            assert_eq!(config.traversal.cancel_mode, CancelMode::Abandon);
        });
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        with_config_env(Path::new("nonexistent.toml"), || {
            let config = Config::load();
            assert!(config.is_err());
        });
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.traversal.max_concurrency, 10);
        assert_eq!(config.traversal.batch_chunk_size, 50);
        assert!(config.traversal.dedupe_values);
        assert_eq!(config.traversal.cancel_mode, CancelMode::Drain);
        assert_eq!(config.server.max_retries, 3);
        assert!(config.server.base_url.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_pages() {
        let config = Config::from_toml_str("[traversal]\nmax_pages = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_pages"));
    }

    #[test]
    fn test_validate_rejects_non_http_base_url() {
        let config = Config::from_toml_str("[server]\nbase_url = \"ftp://example.org\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_traversal_options_follow_config() {
        let config = Config::from_toml_str(TEST_CONFIG).unwrap();
        let options = config.traversal_options();
        assert_eq!(options.max_depth, 4);
        assert_eq!(options.max_pages, 7);
        assert_eq!(options.query_policy.batch_chunk_size, 20);
        assert!(!options.query_policy.dedupe_values);
        assert_eq!(options.cancel_mode, CancelMode::Abandon);
        assert!(!options.cancellation.is_cancelled());
    }
}
