//! Business configuration
//!
//! `TraceConfig` is the loader seam the services read through. Keys keep the
//! names operators already use in the config center; `StaticTraceConfig`
//! serves them from a snapshot deserialized out of the app config file.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::constants::DEFAULT_MAX_DURATION_DAY;
use crate::data::broker::{Compression, ConsumerConfig, ProducerConfig};
use crate::data::types::{AnnotationType, FieldMetaInfo, PlatformType, TtlClass};
use crate::domain::error::{ServiceError, ServiceResult};

// ============================================================================
// SNAPSHOT TYPES
// ============================================================================

/// A saved filter exposed as a selectable view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemView {
    pub id: i64,
    pub view_name: String,
    /// JSON-encoded `FilterFields`
    #[serde(default)]
    pub filters: String,
}

/// Processor stage names per platform or tenant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanHandlerConfig {
    /// platform -> query post-processors
    #[serde(default)]
    pub platform_processors: HashMap<String, Vec<String>>,
    /// tenant -> stages run before a batch is sent
    #[serde(default)]
    pub ingest_processors: HashMap<String, Vec<String>>,
    /// tenant -> stages run before a batch is stored
    #[serde(default)]
    pub consume_processors: HashMap<String, Vec<String>>,
}

/// Per-tenant broker and retention record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub producer_group: String,
    #[serde(default)]
    pub consumer_group: String,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub produce_timeout_ms: Option<u64>,
    #[serde(default)]
    pub consume_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_times: Option<u32>,
    #[serde(default)]
    pub ttl: TtlClass,
    #[serde(default)]
    pub orderly: bool,
    #[serde(default)]
    pub compression: Option<Compression>,
}

fn or_base(own: &str, base: &str) -> String {
    let chosen = if own.is_empty() { base } else { own };
    chosen.to_string()
}

impl TenantConfig {
    /// Producer settings for this tenant, falling back to the shared ingest producer
    pub fn producer_config(&self, base: &ProducerConfig) -> ProducerConfig {
        ProducerConfig {
            addresses: if self.addresses.is_empty() {
                base.addresses.clone()
            } else {
                self.addresses.clone()
            },
            topic: or_base(&self.topic, &base.topic),
            producer_group: or_base(&self.producer_group, &base.producer_group),
            produce_timeout_ms: self.produce_timeout_ms.or(base.produce_timeout_ms),
            retry_times: self.retry_times.unwrap_or(base.retry_times),
            compression: self.compression.unwrap_or(base.compression),
            queue_capacity: base.queue_capacity,
        }
    }

    /// Consumer settings for the tenant's ingest worker
    pub fn consumer_config(&self, base: &ProducerConfig) -> ConsumerConfig {
        ConsumerConfig {
            addresses: if self.addresses.is_empty() {
                base.addresses.clone()
            } else {
                self.addresses.clone()
            },
            topic: or_base(&self.topic, &base.topic),
            consumer_group: self.consumer_group.clone(),
            tag_expression: None,
            consume_timeout_ms: self.consume_timeout_ms,
            concurrency: self.concurrency,
            orderly: self.orderly,
            max_reconsume_times: None,
            compression: self.compression.unwrap_or(base.compression),
        }
    }
}

/// Physical tables of one tenant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantTables {
    /// TTL class ("7d", ...) -> span table
    #[serde(default)]
    pub span_tables: HashMap<String, String>,
    #[serde(default)]
    pub annotation_table: String,
}

impl TenantTables {
    pub fn span_table(&self, ttl: TtlClass) -> Option<&str> {
        self.span_tables.get(ttl.as_str()).map(String::as_str)
    }

    /// Every span table, in stable order
    pub fn all_span_tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.span_tables.values().map(String::as_str).collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }
}

/// Analytical store connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CkConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Object-store promotion thresholds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrTosConfig {
    /// Promote `input` when longer than this many bytes
    #[serde(default)]
    pub input_threshold_bytes: Option<usize>,
    #[serde(default)]
    pub output_threshold_bytes: Option<usize>,
    /// Bytes kept inline as a preview of a promoted body
    #[serde(default)]
    pub preview_bytes: Option<usize>,
}

/// Caller -> where automated annotations land
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationSource {
    pub tenants: Vec<String>,
    pub annotation_type: AnnotationType,
}

/// Deserialized business configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceConfigSnapshot {
    #[serde(default)]
    pub trace_system_view_cfg: Option<Vec<SystemView>>,
    #[serde(default)]
    pub trace_platform_tenants: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub trace_platform_span_handler_config: Option<SpanHandlerConfig>,
    #[serde(default)]
    pub trace_mq_producer_config: Option<ProducerConfig>,
    #[serde(default)]
    pub annotation_mq_producer_config: Option<ProducerConfig>,
    #[serde(default)]
    pub annotation_mq_consumer_config: Option<ConsumerConfig>,
    #[serde(default)]
    pub trace_tenant_cfg: Option<Vec<TenantConfig>>,
    #[serde(default)]
    pub trace_tenant_tables_cfg: Option<HashMap<String, TenantTables>>,
    #[serde(default)]
    pub trace_ck_cfg: Option<CkConfig>,
    #[serde(default)]
    pub trace_field_meta_info: Option<FieldMetaInfo>,
    #[serde(default)]
    pub trace_attr_tos_cfg: Option<AttrTosConfig>,
    #[serde(default)]
    pub trace_max_duration_day: Option<HashMap<String, i64>>,
    #[serde(default)]
    pub trace_default_tenant: Option<String>,
    #[serde(default)]
    pub annotation_source_config: Option<HashMap<String, AnnotationSource>>,
}

// ============================================================================
// LOADER SEAM
// ============================================================================

pub trait TraceConfig: Send + Sync {
    fn system_views(&self) -> ServiceResult<Vec<SystemView>>;

    /// Tenants a query for `platform` reads from
    fn platform_tenants(&self, platform: PlatformType) -> ServiceResult<Vec<String>>;

    fn span_handler_config(&self) -> ServiceResult<SpanHandlerConfig>;

    fn trace_producer_config(&self) -> ServiceResult<ProducerConfig>;

    fn annotation_producer_config(&self) -> ServiceResult<ProducerConfig>;

    fn annotation_consumer_config(&self) -> ServiceResult<ConsumerConfig>;

    /// Unknown tenant is an internal error
    fn tenant_config(&self, tenant: &str) -> ServiceResult<TenantConfig>;

    fn tenant_configs(&self) -> Vec<TenantConfig>;

    fn tenant_tables(&self) -> ServiceResult<HashMap<String, TenantTables>>;

    fn ck_config(&self) -> Option<CkConfig>;

    fn field_meta_info(&self) -> ServiceResult<FieldMetaInfo>;

    fn attr_tos_config(&self) -> AttrTosConfig;

    /// Longest allowed query window in days
    fn max_duration_day(&self, platform: PlatformType) -> i64;

    fn default_tenant(&self) -> ServiceResult<String>;

    fn annotation_source(&self, caller: &str) -> ServiceResult<AnnotationSource>;
}

/// `TraceConfig` over an in-memory snapshot
#[derive(Debug, Default)]
pub struct StaticTraceConfig {
    snapshot: RwLock<TraceConfigSnapshot>,
}

fn required<T: Clone>(value: &Option<T>, key: &str) -> ServiceResult<T> {
    value.clone().ok_or_else(|| ServiceError::missing_config(key))
}

impl StaticTraceConfig {
    pub fn new(snapshot: TraceConfigSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    /// Swap in a new snapshot; readers see it on their next call
    pub fn replace(&self, snapshot: TraceConfigSnapshot) {
        *self.snapshot.write() = snapshot;
    }
}

impl TraceConfig for StaticTraceConfig {
    fn system_views(&self) -> ServiceResult<Vec<SystemView>> {
        required(&self.snapshot.read().trace_system_view_cfg, "trace_system_view_cfg")
    }

    fn platform_tenants(&self, platform: PlatformType) -> ServiceResult<Vec<String>> {
        let snapshot = self.snapshot.read();
        let map = snapshot
            .trace_platform_tenants
            .as_ref()
            .ok_or_else(|| ServiceError::missing_config("trace_platform_tenants"))?;
        map.get(platform.as_str()).cloned().ok_or_else(|| {
            ServiceError::invalid_argument(format!("no tenants configured for platform {platform}"))
        })
    }

    fn span_handler_config(&self) -> ServiceResult<SpanHandlerConfig> {
        required(
            &self.snapshot.read().trace_platform_span_handler_config,
            "trace_platform_span_handler_config",
        )
    }

    fn trace_producer_config(&self) -> ServiceResult<ProducerConfig> {
        required(&self.snapshot.read().trace_mq_producer_config, "trace_mq_producer_config")
    }

    fn annotation_producer_config(&self) -> ServiceResult<ProducerConfig> {
        required(
            &self.snapshot.read().annotation_mq_producer_config,
            "annotation_mq_producer_config",
        )
    }

    fn annotation_consumer_config(&self) -> ServiceResult<ConsumerConfig> {
        required(
            &self.snapshot.read().annotation_mq_consumer_config,
            "annotation_mq_consumer_config",
        )
    }

    fn tenant_config(&self, tenant: &str) -> ServiceResult<TenantConfig> {
        self.snapshot
            .read()
            .trace_tenant_cfg
            .iter()
            .flatten()
            .find(|t| t.tenant == tenant)
            .cloned()
            .ok_or_else(|| ServiceError::internal(format!("unknown tenant: {tenant}")))
    }

    fn tenant_configs(&self) -> Vec<TenantConfig> {
        self.snapshot
            .read()
            .trace_tenant_cfg
            .clone()
            .unwrap_or_default()
    }

    fn tenant_tables(&self) -> ServiceResult<HashMap<String, TenantTables>> {
        required(&self.snapshot.read().trace_tenant_tables_cfg, "trace_tenant_tables_cfg")
    }

    fn ck_config(&self) -> Option<CkConfig> {
        self.snapshot.read().trace_ck_cfg.clone()
    }

    fn field_meta_info(&self) -> ServiceResult<FieldMetaInfo> {
        required(&self.snapshot.read().trace_field_meta_info, "trace_field_meta_info")
    }

    fn attr_tos_config(&self) -> AttrTosConfig {
        self.snapshot
            .read()
            .trace_attr_tos_cfg
            .clone()
            .unwrap_or_default()
    }

    fn max_duration_day(&self, platform: PlatformType) -> i64 {
        self.snapshot
            .read()
            .trace_max_duration_day
            .as_ref()
            .and_then(|m| m.get(platform.as_str()).copied())
            .unwrap_or(DEFAULT_MAX_DURATION_DAY)
    }

    fn default_tenant(&self) -> ServiceResult<String> {
        required(&self.snapshot.read().trace_default_tenant, "trace_default_tenant")
    }

    fn annotation_source(&self, caller: &str) -> ServiceResult<AnnotationSource> {
        let snapshot = self.snapshot.read();
        let sources = snapshot
            .annotation_source_config
            .as_ref()
            .ok_or_else(|| ServiceError::missing_config("annotation_source_config"))?;
        sources
            .get(caller)
            .cloned()
            .ok_or_else(|| ServiceError::invalid_argument(format!("unknown annotation caller: {caller}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;

    const SAMPLE: &str = r#"{
        "trace_platform_tenants": {"cozeloop": ["spans_default"], "prompt": ["spans_default", "spans_prompt"]},
        "trace_mq_producer_config": {"topic": "trace_ingest", "producer_group": "pg", "retry_times": 2},
        "trace_tenant_cfg": [
            {"tenant": "spans_default", "consumer_group": "cg", "ttl": "30d", "concurrency": 8},
            {"tenant": "spans_prompt", "topic": "prompt_ingest", "compression": "zstd"}
        ],
        "trace_tenant_tables_cfg": {
            "spans_default": {"span_tables": {"7d": "spans_7d", "30d": "spans_30d"}, "annotation_table": "annotations"}
        },
        "trace_max_duration_day": {"cozeloop": 30},
        "trace_default_tenant": "spans_default",
        "annotation_source_config": {
            "evaluation": {"tenants": ["spans_default"], "annotation_type": "auto_evaluator"}
        }
    }"#;

    fn config() -> StaticTraceConfig {
        StaticTraceConfig::from_json(SAMPLE).unwrap()
    }

    #[test]
    fn test_platform_tenants() {
        let cfg = config();
        assert_eq!(
            cfg.platform_tenants(PlatformType::Prompt).unwrap(),
            vec!["spans_default", "spans_prompt"]
        );
        let err = cfg.platform_tenants(PlatformType::Evaluator).unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_missing_required_key_is_invalid_argument() {
        let err = config().system_views().unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));
        assert!(err.message.contains("trace_system_view_cfg"));
    }

    #[test]
    fn test_unknown_tenant_is_internal() {
        let err = config().tenant_config("nope").unwrap_err();
        assert!(err.is(ErrorKind::Internal));
    }

    #[test]
    fn test_tenant_producer_falls_back_to_shared_config() {
        let cfg = config();
        let base = cfg.trace_producer_config().unwrap();

        let default = cfg.tenant_config("spans_default").unwrap();
        let producer = default.producer_config(&base);
        assert_eq!(producer.topic, "trace_ingest");
        assert_eq!(producer.retry_times, 2);
        assert_eq!(default.ttl, TtlClass::Days30);

        let prompt = cfg.tenant_config("spans_prompt").unwrap();
        let producer = prompt.producer_config(&base);
        assert_eq!(producer.topic, "prompt_ingest");
        assert_eq!(producer.compression, Compression::Zstd);

        let consumer = default.consumer_config(&base);
        assert_eq!(consumer.topic, "trace_ingest");
        assert_eq!(consumer.consumer_group, "cg");
        assert_eq!(consumer.concurrency, Some(8));
    }

    #[test]
    fn test_span_table_by_ttl() {
        let tables = config().tenant_tables().unwrap();
        let default = &tables["spans_default"];
        assert_eq!(default.span_table(TtlClass::Days30), Some("spans_30d"));
        assert_eq!(default.span_table(TtlClass::Days3), None);
        assert_eq!(default.all_span_tables(), vec!["spans_30d", "spans_7d"]);
    }

    #[test]
    fn test_max_duration_day_defaults() {
        let cfg = config();
        assert_eq!(cfg.max_duration_day(PlatformType::Cozeloop), 30);
        assert_eq!(
            cfg.max_duration_day(PlatformType::Prompt),
            DEFAULT_MAX_DURATION_DAY
        );
    }

    #[test]
    fn test_annotation_source() {
        let cfg = config();
        let source = cfg.annotation_source("evaluation").unwrap();
        assert_eq!(source.annotation_type, AnnotationType::AutoEvaluator);
        assert!(cfg.annotation_source("unknown").is_err());
    }

    #[test]
    fn test_replace_snapshot() {
        let cfg = config();
        cfg.replace(TraceConfigSnapshot::default());
        assert!(cfg.default_tenant().is_err());
        assert!(cfg.tenant_configs().is_empty());
    }
}
