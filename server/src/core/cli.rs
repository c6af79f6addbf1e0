use clap::Parser;

use std::path::PathBuf;

use super::config::{BrokerDriver, StoreBackend};
use super::constants::{
    ENV_BROKER_DRIVER, ENV_CLICKHOUSE_URL, ENV_CONFIG, ENV_LOG, ENV_REDIS_URL, ENV_STORE_BACKEND,
};

#[derive(Parser)]
#[command(name = "looptrace")]
#[command(version, about = "Trace ingestion, query and annotation service", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Log filter (overrides LOOPTRACE_LOG / RUST_LOG)
    #[arg(long, env = ENV_LOG)]
    pub log: Option<String>,

    /// Broker driver (memory or redis)
    #[arg(long, env = ENV_BROKER_DRIVER, value_parser = parse_broker_driver)]
    pub broker: Option<BrokerDriver>,

    /// Span store backend (memory or clickhouse)
    #[arg(long, env = ENV_STORE_BACKEND, value_parser = parse_store_backend)]
    pub store: Option<StoreBackend>,

    /// Redis URL for the stream broker driver
    #[arg(long, env = ENV_REDIS_URL)]
    pub redis_url: Option<String>,

    /// ClickHouse connection URL (when using clickhouse store)
    #[arg(long, env = ENV_CLICKHOUSE_URL)]
    pub clickhouse_url: Option<String>,
}

/// Parse broker driver from CLI/env string
fn parse_broker_driver(s: &str) -> Result<BrokerDriver, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(BrokerDriver::Memory),
        "redis" => Ok(BrokerDriver::Redis),
        _ => Err(format!(
            "Invalid broker driver '{}'. Valid options: memory, redis",
            s
        )),
    }
}

/// Parse store backend from CLI/env string
fn parse_store_backend(s: &str) -> Result<StoreBackend, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(StoreBackend::Memory),
        "clickhouse" => Ok(StoreBackend::Clickhouse),
        _ => Err(format!(
            "Invalid store backend '{}'. Valid options: memory, clickhouse",
            s
        )),
    }
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config: Option<PathBuf>,
    pub log: Option<String>,
    pub broker: Option<BrokerDriver>,
    pub store: Option<StoreBackend>,
    pub redis_url: Option<String>,
    pub clickhouse_url: Option<String>,
}

/// Parse CLI arguments
pub fn parse() -> CliConfig {
    let cli = Cli::parse();
    CliConfig {
        config: cli.config,
        log: cli.log,
        broker: cli.broker,
        store: cli.store,
        redis_url: cli.redis_url,
        clickhouse_url: cli.clickhouse_url,
    }
}
