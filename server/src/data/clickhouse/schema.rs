//! ClickHouse table definitions
//!
//! Span tables are one per tenant and retention class. Rows expire through a
//! table TTL derived from the class. Annotation tables use
//! `ReplacingMergeTree(updated_at)` so a same-ID write supersedes older rows.

use crate::data::types::TtlClass;

/// Retention in days of a TTL class key such as `"30d"`
pub fn ttl_days(key: &str) -> Option<u32> {
    key.strip_suffix('d')?.parse().ok()
}

pub fn ttl_class_days(ttl: TtlClass) -> u32 {
    ttl_days(ttl.as_str()).unwrap_or(7)
}

/// DDL for one span table
pub fn span_table(name: &str, ttl_days: u32) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {name} (
    trace_id                String,
    span_id                 String,
    parent_id               String,
    workspace_id            String,
    start_time              Int64,
    duration                Int64,
    span_name               String,
    span_type               LowCardinality(String),
    status_code             Int32,
    input                   String CODEC(ZSTD(3)),
    output                  String CODEC(ZSTD(3)),
    log_id                  String,
    call_type               LowCardinality(String),
    tags_string             Map(String, String),
    tags_long               Map(String, Int64),
    tags_double             Map(String, Float64),
    tags_bool               Map(String, Bool),
    system_tags_string      Map(String, String),

    INDEX idx_trace_id trace_id TYPE bloom_filter(0.01) GRANULARITY 1,
    INDEX idx_span_id span_id TYPE bloom_filter(0.01) GRANULARITY 1,
    INDEX idx_log_id log_id TYPE bloom_filter(0.01) GRANULARITY 1
) ENGINE = ReplacingMergeTree()
PARTITION BY toDate(fromUnixTimestamp64Micro(start_time))
ORDER BY (workspace_id, start_time, span_id)
TTL toDateTime(fromUnixTimestamp64Micro(start_time)) + INTERVAL {ttl_days} DAY DELETE
"#
    )
}

/// DDL for one annotation table
pub fn annotation_table(name: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {name} (
    id                      String,
    workspace_id            String,
    trace_id                String,
    span_id                 String,
    start_time              Int64,
    annotation_type         LowCardinality(String),
    key                     String,
    value_type              LowCardinality(String),
    value                   String,
    reasoning               String,
    status                  LowCardinality(String),
    created_by              String,
    updated_by              String,
    created_at              Int64,
    updated_at              Int64,
    is_deleted              Bool,

    INDEX idx_trace_id trace_id TYPE bloom_filter(0.01) GRANULARITY 1
) ENGINE = ReplacingMergeTree(updated_at)
PARTITION BY toYYYYMM(fromUnixTimestamp64Micro(start_time))
ORDER BY (workspace_id, trace_id, span_id, id)
"#
    )
}
