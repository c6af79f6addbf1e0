use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_MEMORY_BACKLOG, DEFAULT_REDIS_URL, DEFAULT_STREAM_MAX_LEN,
    ENV_CLICKHOUSE_DATABASE, ENV_CLICKHOUSE_PASSWORD, ENV_CLICKHOUSE_URL, ENV_CLICKHOUSE_USER,
};
use super::trace_config::{CkConfig, TraceConfigSnapshot};
use crate::data::broker::BrokerSettings;

/// Default ClickHouse URL
const DEFAULT_CLICKHOUSE_URL: &str = "http://localhost:8123";

/// Default ClickHouse database
const DEFAULT_CLICKHOUSE_DATABASE: &str = "looptrace";

/// Default ClickHouse query timeout
const DEFAULT_CLICKHOUSE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Backend Enums
// =============================================================================

/// Message broker driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerDriver {
    #[default]
    Memory,
    Redis,
}

impl fmt::Display for BrokerDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerDriver::Memory => write!(f, "memory"),
            BrokerDriver::Redis => write!(f, "redis"),
        }
    }
}

/// Span and annotation store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Clickhouse,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Clickhouse => write!(f, "clickhouse"),
        }
    }
}

// =============================================================================
// File Config (all fields optional)
// =============================================================================

/// Broker configuration section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct BrokerFileConfig {
    pub driver: Option<BrokerDriver>,
    /// Redis URL (or use LOOPTRACE_REDIS_URL env var)
    pub redis_url: Option<String>,
    /// Approximate MAXLEN applied on XADD
    pub stream_max_len: Option<usize>,
    /// Messages held for a topic before any consumer group exists (memory driver)
    pub memory_backlog: Option<usize>,
}

/// ClickHouse configuration section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ClickhouseFileConfig {
    pub url: Option<String>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Store configuration section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreFileConfig {
    pub backend: Option<StoreBackend>,
    pub clickhouse: Option<ClickhouseFileConfig>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub broker: Option<BrokerFileConfig>,
    pub store: Option<StoreFileConfig>,
    pub trace: Option<TraceConfigSnapshot>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }
}

// =============================================================================
// Final Config
// =============================================================================

/// Broker configuration (final/runtime)
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub driver: BrokerDriver,
    pub redis_url: String,
    pub stream_max_len: usize,
    pub memory_backlog: usize,
}

impl BrokerConfig {
    pub fn settings(&self) -> BrokerSettings {
        match self.driver {
            BrokerDriver::Memory => BrokerSettings::Memory {
                backlog_capacity: self.memory_backlog,
            },
            BrokerDriver::Redis => BrokerSettings::Redis {
                url: self.redis_url.clone(),
                stream_max_len: self.stream_max_len,
            },
        }
    }
}

/// ClickHouse configuration (final/runtime)
#[derive(Debug, Clone)]
pub struct ClickhouseConfig {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

/// Store configuration (final/runtime)
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub clickhouse: ClickhouseConfig,
}

/// Final merged application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub trace: TraceConfigSnapshot,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Local `looptrace.json` OR CLI-specified config path
    /// 3. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let path = if let Some(ref path) = cli.config {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Some(path.clone())
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };

        let file_config = match path {
            Some(path) => {
                let config = FileConfig::load_from_file(&path)?;
                config.warn_unknown_fields();
                config
            }
            None => FileConfig::default(),
        };

        let config = Self::resolve(file_config, cli);
        config.validate()?;
        Ok(config)
    }

    /// Layer configs: defaults -> file config -> CLI/env overrides
    fn resolve(file_config: FileConfig, cli: &CliConfig) -> Self {
        let file_broker = file_config.broker.unwrap_or_default();
        let file_store = file_config.store.unwrap_or_default();
        let file_ck = file_store.clickhouse.unwrap_or_default();
        let trace = file_config.trace.unwrap_or_default();
        let trace_ck = trace.trace_ck_cfg.clone().unwrap_or_default();

        let broker = BrokerConfig {
            driver: cli.broker.or(file_broker.driver).unwrap_or_default(),
            redis_url: cli
                .redis_url
                .clone()
                .or(file_broker.redis_url)
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            stream_max_len: file_broker.stream_max_len.unwrap_or(DEFAULT_STREAM_MAX_LEN),
            memory_backlog: file_broker.memory_backlog.unwrap_or(DEFAULT_MEMORY_BACKLOG),
        };

        let CkConfig {
            url: ck_url,
            database: ck_database,
            user: ck_user,
            password: ck_password,
            timeout_secs: ck_timeout,
        } = trace_ck;
        let clickhouse = ClickhouseConfig {
            url: cli
                .clickhouse_url
                .clone()
                .or(file_ck.url)
                .or(ck_url)
                .unwrap_or_else(|| DEFAULT_CLICKHOUSE_URL.to_string()),
            database: env_var(ENV_CLICKHOUSE_DATABASE)
                .or(file_ck.database)
                .or(ck_database)
                .unwrap_or_else(|| DEFAULT_CLICKHOUSE_DATABASE.to_string()),
            user: env_var(ENV_CLICKHOUSE_USER).or(file_ck.user).or(ck_user),
            password: env_var(ENV_CLICKHOUSE_PASSWORD)
                .or(file_ck.password)
                .or(ck_password),
            timeout_secs: file_ck
                .timeout_secs
                .or(ck_timeout)
                .unwrap_or(DEFAULT_CLICKHOUSE_TIMEOUT_SECS),
        };

        Self {
            broker,
            store: StoreConfig {
                backend: cli.store.or(file_store.backend).unwrap_or_default(),
                clickhouse,
            },
            trace,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.broker.driver == BrokerDriver::Redis && self.broker.redis_url.is_empty() {
            anyhow::bail!("redis broker requires a Redis URL");
        }
        if self.store.backend == StoreBackend::Clickhouse && self.store.clickhouse.url.is_empty() {
            anyhow::bail!(
                "clickhouse store requires a URL (set {} or store.clickhouse.url)",
                ENV_CLICKHOUSE_URL
            );
        }
        if self.broker.stream_max_len == 0 {
            anyhow::bail!("broker.stream_max_len must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_serde() {
        let driver: BrokerDriver = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(driver, BrokerDriver::Redis);
        let store: StoreBackend = serde_json::from_str("\"clickhouse\"").unwrap();
        assert_eq!(store, StoreBackend::Clickhouse);
        assert_eq!(StoreBackend::Memory.to_string(), "memory");
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::resolve(FileConfig::default(), &CliConfig::default());
        assert_eq!(config.broker.driver, BrokerDriver::Memory);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.broker.memory_backlog, DEFAULT_MEMORY_BACKLOG);
        assert!(config.trace.trace_default_tenant.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_file_config_parse_full() {
        let file = FileConfig::parse(
            r#"{
                "broker": {"driver": "redis", "redis_url": "redis://cache:6379/1", "stream_max_len": 5000},
                "store": {"backend": "clickhouse", "clickhouse": {"database": "traces"}},
                "trace": {
                    "trace_default_tenant": "spans_default",
                    "trace_ck_cfg": {"url": "http://ck:8123", "user": "svc"}
                }
            }"#,
        )
        .unwrap();
        let config = AppConfig::resolve(file, &CliConfig::default());
        assert_eq!(config.broker.driver, BrokerDriver::Redis);
        assert_eq!(config.broker.redis_url, "redis://cache:6379/1");
        assert_eq!(config.broker.stream_max_len, 5000);
        assert_eq!(config.store.backend, StoreBackend::Clickhouse);
        assert_eq!(config.store.clickhouse.url, "http://ck:8123");
        assert_eq!(config.store.clickhouse.database, "traces");
        assert_eq!(
            config.trace.trace_default_tenant.as_deref(),
            Some("spans_default")
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FileConfig::parse(r#"{"broker": {"driver": "redis"}}"#).unwrap();
        let cli = CliConfig {
            broker: Some(BrokerDriver::Memory),
            clickhouse_url: Some("http://override:8123".to_string()),
            ..Default::default()
        };
        let config = AppConfig::resolve(file, &cli);
        assert_eq!(config.broker.driver, BrokerDriver::Memory);
        assert_eq!(config.store.clickhouse.url, "http://override:8123");
    }

    #[test]
    fn test_unknown_fields_are_collected() {
        let file = FileConfig::parse(r#"{"brokr": {}}"#).unwrap();
        let serde_json::Value::Object(map) = &file.extra else {
            panic!("extra should be an object");
        };
        assert!(map.contains_key("brokr"));
    }

    #[test]
    fn test_broker_settings() {
        let config = AppConfig::resolve(FileConfig::default(), &CliConfig::default());
        assert!(matches!(
            config.broker.settings(),
            BrokerSettings::Memory { .. }
        ));
    }
}
