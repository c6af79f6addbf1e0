//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;
pub mod trace_config;

pub use crate::app::CoreApp;
pub use cli::CliConfig;
pub use config::{AppConfig, BrokerDriver, StoreBackend};
pub use shutdown::ShutdownService;
pub use trace_config::{StaticTraceConfig, TraceConfig};
