//! Configuration loading from TOML files

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use pagesweep_core::{QueryNames, RateLimitConfig, RetryConfig, DEFAULT_MAX_PAGES};

/// Global configuration for pagesweep
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub sweep: SweepConfig,
    pub rate: RateConfig,
    pub retry: RetryFileConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub query_names: QueryNames,
    /// Seconds
    pub request_timeout: u64,
    /// Seconds
    pub connect_timeout: u64,
    pub max_connections: usize,
    pub user_agent: Option<String>,
    /// Extra request headers; values may be `${VAR}` references
    #[serde(deserialize_with = "deserialize_env_map")]
    pub headers: BTreeMap<String, String>,
}

/// Parameter names of the court communications API
fn comunica_query_names() -> QueryNames {
    QueryNames {
        page: "pagina".to_string(),
        page_size: "itensPorPagina".to_string(),
        partition_key: "siglaTribunal".to_string(),
        date_range_start: "dataDisponibilizacaoInicio".to_string(),
        date_range_end: "dataDisponibilizacaoFim".to_string(),
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://comunicaapi.pje.jus.br/api/v1/comunicacao".to_string(),
            query_names: comunica_query_names(),
            request_timeout: 30,
            connect_timeout: 10,
            max_connections: 16,
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Partition keys used when none are given on the command line
    pub partitions: Vec<String>,
    pub page_size: u32,
    pub page_workers: usize,
    pub partition_workers: usize,
    /// Seconds
    pub partition_timeout: u64,
    /// Seconds; unset waits for every partition
    pub run_timeout: Option<u64>,
    /// Partitions reporting more pages than this are marked failed
    pub max_pages: u32,
    /// Extra query parameters sent with every request
    pub params: BTreeMap<String, String>,
    /// Keep only items whose field equals the given text
    pub keep: BTreeMap<String, String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            page_size: 100,
            page_workers: 3,
            partition_workers: 3,
            partition_timeout: 1800,
            run_timeout: None,
            max_pages: DEFAULT_MAX_PAGES,
            params: BTreeMap::new(),
            keep: BTreeMap::new(),
        }
    }
}

/// Requests per second
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub initial: f64,
    pub min: f64,
    pub max: f64,
    pub increment: f64,
    pub decay: f64,
    /// Seconds without throttling before the rate is raised
    pub recovery_window: u64,
    /// Upper bound on a server Retry-After pause, seconds
    pub max_pause: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        let d = RateLimitConfig::default();
        Self {
            initial: d.initial_rate,
            min: d.min_rate,
            max: d.max_rate,
            increment: d.increment,
            decay: d.decay,
            recovery_window: d.recovery_window.as_secs(),
            max_pause: d.max_pause.as_secs(),
        }
    }
}

impl RateConfig {
    pub fn to_limits(self) -> RateLimitConfig {
        RateLimitConfig {
            initial_rate: self.initial,
            min_rate: self.min,
            max_rate: self.max,
            increment: self.increment,
            decay: self.decay,
            recovery_window: Duration::from_secs(self.recovery_window),
            max_pause: Duration::from_secs(self.max_pause),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryFileConfig {
    /// Total attempts per page
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    /// Seconds
    pub max_backoff: u64,
}

impl Default for RetryFileConfig {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            max_retries: d.max_retries,
            base_backoff_ms: d.base_backoff.as_millis() as u64,
            max_backoff: d.max_backoff.as_secs(),
        }
    }
}

impl RetryFileConfig {
    pub fn to_retry(self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./cache"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Request log (JSON lines)
    pub path: PathBuf,
    pub batch_size: usize,
    /// Start each run with an empty request log
    pub truncate: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logs/requests.jsonl"),
            batch_size: 50,
            truncate: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./output"),
        }
    }
}

/// Deserialize a map whose values may reference environment variables like ${VAR}.
/// Entries whose variable is unset are dropped.
fn deserialize_env_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| expand_env_var(&v).map(|v| (k, v)))
        .collect())
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./pagesweep.toml (current directory)
    /// 2. ~/.config/pagesweep/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("pagesweep.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "pagesweep") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
