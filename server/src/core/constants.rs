// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "LoopTrace";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "looptrace.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "LOOPTRACE_CONFIG";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "LOOPTRACE_LOG";

// =============================================================================
// Environment Variables - Backends
// =============================================================================

/// Environment variable selecting the broker driver (memory or redis)
pub const ENV_BROKER_DRIVER: &str = "LOOPTRACE_BROKER";

/// Environment variable selecting the span store (memory or clickhouse)
pub const ENV_STORE_BACKEND: &str = "LOOPTRACE_STORE";

/// Environment variable for the Redis broker URL
pub const ENV_REDIS_URL: &str = "LOOPTRACE_REDIS_URL";

/// Environment variable for the ClickHouse URL
pub const ENV_CLICKHOUSE_URL: &str = "LOOPTRACE_CLICKHOUSE_URL";

/// Environment variable for the ClickHouse database
pub const ENV_CLICKHOUSE_DATABASE: &str = "LOOPTRACE_CLICKHOUSE_DATABASE";

/// Environment variable for the ClickHouse user
pub const ENV_CLICKHOUSE_USER: &str = "LOOPTRACE_CLICKHOUSE_USER";

/// Environment variable for the ClickHouse password
pub const ENV_CLICKHOUSE_PASSWORD: &str = "LOOPTRACE_CLICKHOUSE_PASSWORD";

// =============================================================================
// Shutdown
// =============================================================================

/// Maximum time to wait for background tasks during shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Broker Defaults
// =============================================================================

/// Default Redis URL for the stream driver
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";

/// Default Redis port used when an address omits it
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Approximate MAXLEN applied to every Redis stream
pub const DEFAULT_STREAM_MAX_LEN: usize = 1_000_000;

/// Per consumer group backlog of the in-memory driver
pub const DEFAULT_MEMORY_BACKLOG: usize = 100_000;

/// Produce timeout when the topic config leaves it unset
pub const DEFAULT_PRODUCE_TIMEOUT_MS: u64 = 3_000;

/// Consume timeout when the topic config leaves it unset
pub const DEFAULT_CONSUME_TIMEOUT_MS: u64 = 60_000;

/// Handler concurrency when the topic config leaves it unset
pub const DEFAULT_CONSUME_CONCURRENCY: usize = 4;

/// Redelivery attempts before a failing message is dropped
pub const DEFAULT_MAX_RECONSUME_TIMES: u32 = 16;

/// First delay level used when redelivering a failed message (10s)
pub const REDELIVERY_START_LEVEL: u8 = 3;

/// Block timeout for XREADGROUP
pub const STREAM_BLOCK_MS: u64 = 1_000;

/// Messages fetched per XREADGROUP call
pub const STREAM_READ_COUNT: usize = 64;

/// Poll interval of the Redis delayed-message mover
pub const DELAYED_POLL_INTERVAL_MS: u64 = 500;

/// Poll interval of the Redis pending-entry reclaimer
pub const PENDING_CLAIM_INTERVAL_MS: u64 = 30_000;

/// Idle time past the consume timeout before a pending entry is reclaimed
pub const PENDING_CLAIM_GRACE_MS: u64 = 30_000;

// =============================================================================
// Ingestion
// =============================================================================

/// Hard limit on one marshalled TraceData message
pub const MAX_BATCH_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// Default preview length kept inline when input/output is offloaded
pub const DEFAULT_OFFLOAD_PREVIEW_BYTES: usize = 1024;

// =============================================================================
// Query
// =============================================================================

/// Maximum spans fetched for a single trace
pub const GET_TRACE_LIMIT: usize = 1000;

/// Default page size of ListSpans
pub const DEFAULT_LIST_SPANS_LIMIT: usize = 100;

/// Upper bound on ListSpans page size
pub const MAX_LIST_SPANS_LIMIT: usize = 1000;

/// Window read by each GetTracesAdvanceInfo sub-query (15 minutes)
pub const ADVANCE_INFO_WINDOW_MICROS: i64 = 15 * 60 * 1_000_000;

/// Worker pool size of GetTracesAdvanceInfo
pub const ADVANCE_INFO_CONCURRENCY: usize = 10;

/// Max query window when a platform has no explicit setting
pub const DEFAULT_MAX_DURATION_DAY: i64 = 7;

// =============================================================================
// Annotations
// =============================================================================

/// Half-width of the span lookup window for manual annotations (1 second)
pub const MANUAL_ANNOTATION_WINDOW_MICROS: i64 = 1_000_000;

/// Half-width of the ListAnnotations window (1 second)
pub const LIST_ANNOTATIONS_WINDOW_MICROS: i64 = 1_000_000;

/// Retry budget of a freshly published annotation event
pub const ANNOTATION_RETRY_TIMES: u32 = 3;

/// Delivery delay of annotation retry events
pub const ANNOTATION_EVENT_DEFER_SECS: u64 = 10;

/// Length of the hex annotation ID
pub const ANNOTATION_ID_LEN: usize = 32;
