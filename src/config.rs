use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_verify_certs")]
    pub verify_certs: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            username: None,
            password: None,
            verify_certs: true,
            path: None,
            timeout_secs: default_search_timeout_secs(),
            per_page: default_per_page(),
        }
    }
}

fn default_backend() -> String {
    "disabled".to_string()
}
fn default_verify_certs() -> bool {
    true
}
fn default_search_timeout_secs() -> u64 {
    5
}
fn default_per_page() -> i64 {
    10
}

impl SearchConfig {
    pub fn is_enabled(&self) -> bool {
        self.backend != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Jobs still `started` this long after they were claimed are marked
    /// failed by the worker's periodic sweep.
    #[serde(default = "default_abandon_after_secs")]
    pub abandon_after_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            name: default_queue_name(),
            result_ttl_secs: default_result_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            abandon_after_secs: default_abandon_after_secs(),
        }
    }
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("./data/queue.sqlite")
}
fn default_queue_name() -> String {
    "microblog-tasks".to_string()
}
fn default_result_ttl_secs() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_abandon_after_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            export_dir: default_export_dir(),
        }
    }
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("./data/exports")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.search.backend.as_str() {
        "disabled" | "memory" => {}
        "elasticsearch" => {
            if config.search.url.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("search.url must be set when backend is 'elasticsearch'");
            }
        }
        "sqlite" => {
            if config.search.path.is_none() {
                anyhow::bail!("search.path must be set when backend is 'sqlite'");
            }
        }
        other => anyhow::bail!(
            "Unknown search backend: '{}'. Must be disabled, elasticsearch, sqlite, or memory.",
            other
        ),
    }

    if config.search.per_page < 1 {
        anyhow::bail!("search.per_page must be >= 1");
    }

    if config.search.timeout_secs == 0 {
        anyhow::bail!("search.timeout_secs must be > 0");
    }

    if config.queue.name.trim().is_empty() {
        anyhow::bail!("queue.name must not be empty");
    }

    Ok(())
}
