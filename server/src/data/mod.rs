//! Data layer
//!
//! - `broker` - Producer/consumer contract with memory and Redis drivers
//! - `clickhouse` - ClickHouse trace store
//! - `memory` - In-process trace store
//! - `object_store` - Storage for offloaded span bodies
//! - `traits` - `TraceRepository` seam shared by both stores
//! - `types` - Span, annotation and filter types
//! - `error` - Unified error type for the stores

pub mod broker;
pub mod clickhouse;
pub mod error;
pub mod memory;
pub mod object_store;
pub mod traits;
pub mod types;

pub use clickhouse::ClickhouseTraceRepository;
pub use error::DataError;
pub use memory::MemoryTraceRepository;
pub use object_store::{MemoryObjectStore, ObjectStore};
pub use traits::{
    GetTraceParam, ListAnnotationsParam, ListSpansParam, ListSpansResult, SortOrder,
    TraceRepository,
};

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::{ClickhouseConfig, StoreBackend};
use crate::core::trace_config::TenantTables;

/// Trace store selected at startup
///
/// Stored as Arc so the repository can be shared by every service.
pub enum TraceStore {
    /// In-process store (default)
    Memory(Arc<MemoryTraceRepository>),
    /// ClickHouse (for distributed deployments)
    Clickhouse(Arc<ClickhouseTraceRepository>),
}

impl TraceStore {
    /// Initialize the store for `backend`
    ///
    /// ClickHouse requires the tenant table routing from
    /// `trace_tenant_tables_cfg`; the memory store ignores it.
    pub async fn init(
        backend: StoreBackend,
        clickhouse_config: &ClickhouseConfig,
        tables: Option<HashMap<String, TenantTables>>,
    ) -> Result<Self, DataError> {
        match backend {
            StoreBackend::Memory => Ok(Self::Memory(Arc::new(MemoryTraceRepository::new()))),
            StoreBackend::Clickhouse => {
                let tables = tables.ok_or_else(|| {
                    DataError::Config(
                        "trace_tenant_tables_cfg is required for the clickhouse store".to_string(),
                    )
                })?;
                let repo = ClickhouseTraceRepository::init(clickhouse_config, tables).await?;
                Ok(Self::Clickhouse(Arc::new(repo)))
            }
        }
    }

    pub fn backend(&self) -> StoreBackend {
        match self {
            Self::Memory(_) => StoreBackend::Memory,
            Self::Clickhouse(_) => StoreBackend::Clickhouse,
        }
    }

    /// Backend-agnostic repository handle
    pub fn repository(&self) -> Arc<dyn TraceRepository> {
        match self {
            Self::Memory(m) => Arc::clone(m) as Arc<dyn TraceRepository>,
            Self::Clickhouse(c) => Arc::clone(c) as Arc<dyn TraceRepository>,
        }
    }
}
