use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default query endpoint path, relative to the instance URL.
pub const DEFAULT_QUERY_PATH: &str = "/services/data/v63.0/ssot/query-sql";

/// Default environment variable carrying the bearer token.
pub const DEFAULT_TOKEN_ENV: &str = "SESSIONTRACE_ACCESS_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct SessionTraceConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub instance_url: String,
    #[serde(default = "default_query_path")]
    pub query_path: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Total attempts per request, including the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub row_limit: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ApiConfig {
    /// API settings with every tunable at its default.
    pub fn new(instance_url: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into(),
            query_path: default_query_path(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            row_limit: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: DEFAULT_TOKEN_ENV.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractConfig {
    pub output_dir: String,
    pub id_chunk_size: usize,
    pub lookback_hours: i64,
    pub watermark_file: String,
    pub concurrent_leaves: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            output_dir: "./sessiontrace-data".to_string(),
            id_chunk_size: 200,
            lookback_hours: 24,
            watermark_file: "watermark.json".to_string(),
            concurrent_leaves: true,
        }
    }
}

impl ExtractConfig {
    /// Output directory with `~` and `$VAR` references expanded.
    pub fn output_path(&self) -> PathBuf {
        match shellexpand::full(&self.output_dir) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(e) => {
                tracing::warn!(error = %e, path = %self.output_dir, "Could not expand output dir, using it verbatim");
                PathBuf::from(&self.output_dir)
            }
        }
    }

    /// Watermark location; relative names resolve inside the output directory.
    pub fn watermark_path(&self) -> PathBuf {
        self.watermark_path_in(&self.output_path())
    }

    /// Watermark location relative to an already resolved output directory.
    pub fn watermark_path_in(&self, output_dir: &Path) -> PathBuf {
        let file = PathBuf::from(&self.watermark_file);
        if file.is_absolute() {
            file
        } else {
            output_dir.join(file)
        }
    }
}

fn default_query_path() -> String {
    DEFAULT_QUERY_PATH.to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> usize {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl SessionTraceConfig {
    /// Load from a TOML file, then overlay `SESSIONTRACE__SECTION__KEY` env vars.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("SESSIONTRACE").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}
