use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::sources::FetchPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Questdb,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub export_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    #[serde(default = "default_meter_concurrency")]
    pub meter_concurrency: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval_secs(),
            meter_concurrency: default_meter_concurrency(),
        }
    }
}

impl ScheduleConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_attempts: default_fetch_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl FetchConfig {
    pub fn policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            max_attempts: self.max_attempts.max(1),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

/// One configured integration entry and the billing accounts it covers.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsConfig {
    pub entry_id: String,
    pub selected_accounts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    pub control: Option<ControlConfig>,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountsConfig>,
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_update_interval_secs() -> u64 {
    3600
}

fn default_meter_concurrency() -> usize {
    4
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_fetch_attempts() -> u32 {
    3
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("STATISTICS_CONFIG").unwrap_or_else(|_| "statistics-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.store.kind == StoreKind::Questdb && cfg.store.uri.is_empty() {
            anyhow::bail!("store.uri is required for the questdb store");
        }
        Ok(cfg)
    }
}
