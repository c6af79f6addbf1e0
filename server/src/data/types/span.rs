//! Canonical span model
//!
//! Every inbound convention (CozeLoop, OTel GenAI, OpenInference) is folded into
//! this one shape by the normalizer. Tags live in four typed bags and a key is
//! present in at most one of them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// COLUMN AND TAG NAMES
// ============================================================================

pub const COL_TRACE_ID: &str = "trace_id";
pub const COL_SPAN_ID: &str = "span_id";
pub const COL_PARENT_ID: &str = "parent_id";
pub const COL_WORKSPACE_ID: &str = "workspace_id";
pub const COL_START_TIME: &str = "start_time";
pub const COL_DURATION: &str = "duration";
pub const COL_SPAN_NAME: &str = "span_name";
pub const COL_SPAN_TYPE: &str = "span_type";
pub const COL_STATUS_CODE: &str = "status_code";
pub const COL_INPUT: &str = "input";
pub const COL_OUTPUT: &str = "output";
pub const COL_LOG_ID: &str = "log_id";
pub const COL_CALL_TYPE: &str = "call_type";

/// Top-level columns addressable by filters and export mappings
pub const TOP_LEVEL_COLUMNS: &[&str] = &[
    COL_TRACE_ID,
    COL_SPAN_ID,
    COL_PARENT_ID,
    COL_WORKSPACE_ID,
    COL_START_TIME,
    COL_DURATION,
    COL_SPAN_NAME,
    COL_SPAN_TYPE,
    COL_STATUS_CODE,
    COL_INPUT,
    COL_OUTPUT,
    COL_LOG_ID,
    COL_CALL_TYPE,
];

pub const TAG_ERROR: &str = "error";
pub const TAG_MODEL_PROVIDER: &str = "model_provider";
pub const TAG_MODEL_NAME: &str = "model_name";
pub const TAG_INPUT_TOKENS: &str = "input_tokens";
pub const TAG_OUTPUT_TOKENS: &str = "output_tokens";
pub const TAG_TOKENS: &str = "tokens";
pub const TAG_START_TIME_FIRST_RESP: &str = "start_time_first_resp";
pub const TAG_LATENCY_FIRST_RESP: &str = "latency_first_resp";
pub const TAG_CALL_OPTIONS: &str = "call_options";
pub const TAG_LOGID: &str = "logid";

pub const SYSTEM_TAG_RUNTIME: &str = "runtime";
pub const SYSTEM_TAG_TENANT: &str = "tenant";
pub const SYSTEM_TAG_INPUT_TOS_KEY: &str = "input_tos_key";
pub const SYSTEM_TAG_OUTPUT_TOS_KEY: &str = "output_tos_key";

/// Keys the system itself may write into `system_tags_string`
pub const SYSTEM_TAG_ALLOWLIST: &[&str] = &[
    SYSTEM_TAG_RUNTIME,
    SYSTEM_TAG_TENANT,
    SYSTEM_TAG_INPUT_TOS_KEY,
    SYSTEM_TAG_OUTPUT_TOS_KEY,
];

// ============================================================================
// CANONICAL SPAN TYPES
// ============================================================================

pub const SPAN_TYPE_MODEL: &str = "model";
pub const SPAN_TYPE_TOOL: &str = "tool";
pub const SPAN_TYPE_RETRIEVER: &str = "retriever";
pub const SPAN_TYPE_CUSTOM: &str = "custom";

// ============================================================================
// TAG VALUE
// ============================================================================

/// A primitive tag value, tagged by the bag it lives in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
}

impl TagValue {
    /// Render as the string form used for filter comparisons
    pub fn to_filter_string(&self) -> String {
        match self {
            TagValue::String(s) => s.clone(),
            TagValue::Long(v) => v.to_string(),
            TagValue::Double(v) => v.to_string(),
            TagValue::Bool(v) => v.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TagValue::String(s) => serde_json::Value::String(s.clone()),
            TagValue::Long(v) => serde_json::Value::from(*v),
            TagValue::Double(v) => serde_json::Value::from(*v),
            TagValue::Bool(v) => serde_json::Value::Bool(*v),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_filter_string())
    }
}

// ============================================================================
// SPAN
// ============================================================================

/// Canonical span. Times are microseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub span_name: String,
    #[serde(default)]
    pub span_type: String,
    #[serde(default)]
    pub status_code: i32,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub log_id: String,
    #[serde(default)]
    pub call_type: String,
    #[serde(default)]
    pub tags_string: BTreeMap<String, String>,
    #[serde(default)]
    pub tags_long: BTreeMap<String, i64>,
    #[serde(default)]
    pub tags_double: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags_bool: BTreeMap<String, bool>,
    #[serde(default)]
    pub system_tags_string: BTreeMap<String, String>,
}

impl Span {
    pub fn end_time(&self) -> i64 {
        self.start_time + self.duration
    }

    /// Insert a tag, evicting the key from every other bag
    pub fn set_tag(&mut self, key: impl Into<String>, value: TagValue) {
        let key = key.into();
        self.remove_tag(&key);
        match value {
            TagValue::String(v) => {
                self.tags_string.insert(key, v);
            }
            TagValue::Long(v) => {
                self.tags_long.insert(key, v);
            }
            TagValue::Double(v) => {
                self.tags_double.insert(key, v);
            }
            TagValue::Bool(v) => {
                self.tags_bool.insert(key, v);
            }
        }
    }

    /// Remove a key from whichever bag holds it
    pub fn remove_tag(&mut self, key: &str) -> Option<TagValue> {
        if let Some(v) = self.tags_string.remove(key) {
            return Some(TagValue::String(v));
        }
        if let Some(v) = self.tags_long.remove(key) {
            return Some(TagValue::Long(v));
        }
        if let Some(v) = self.tags_double.remove(key) {
            return Some(TagValue::Double(v));
        }
        self.tags_bool.remove(key).map(TagValue::Bool)
    }

    pub fn tag(&self, key: &str) -> Option<TagValue> {
        if let Some(v) = self.tags_string.get(key) {
            return Some(TagValue::String(v.clone()));
        }
        if let Some(v) = self.tags_long.get(key) {
            return Some(TagValue::Long(*v));
        }
        if let Some(v) = self.tags_double.get(key) {
            return Some(TagValue::Double(*v));
        }
        self.tags_bool.get(key).map(|v| TagValue::Bool(*v))
    }

    /// Look up a top-level column by name
    pub fn column(&self, name: &str) -> Option<TagValue> {
        let value = match name {
            COL_TRACE_ID => TagValue::String(self.trace_id.clone()),
            COL_SPAN_ID => TagValue::String(self.span_id.clone()),
            COL_PARENT_ID => TagValue::String(self.parent_id.clone()),
            COL_WORKSPACE_ID => TagValue::String(self.workspace_id.clone()),
            COL_START_TIME => TagValue::Long(self.start_time),
            COL_DURATION => TagValue::Long(self.duration),
            COL_SPAN_NAME => TagValue::String(self.span_name.clone()),
            COL_SPAN_TYPE => TagValue::String(self.span_type.clone()),
            COL_STATUS_CODE => TagValue::Long(i64::from(self.status_code)),
            COL_INPUT => TagValue::String(self.input.clone()),
            COL_OUTPUT => TagValue::String(self.output.clone()),
            COL_LOG_ID => TagValue::String(self.log_id.clone()),
            COL_CALL_TYPE => TagValue::String(self.call_type.clone()),
            _ => return None,
        };
        Some(value)
    }

    /// Column first, then tag bags
    pub fn field(&self, name: &str) -> Option<TagValue> {
        self.column(name).or_else(|| self.tag(name))
    }

    /// True when no key is present in more than one tag bag
    pub fn tag_bags_disjoint(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.tags_string
            .keys()
            .chain(self.tags_long.keys())
            .chain(self.tags_double.keys())
            .chain(self.tags_bool.keys())
            .all(|k| seen.insert(k.as_str()))
    }
}

// ============================================================================
// TENANT ENVELOPE
// ============================================================================

/// Retention class of a span batch; selects the physical table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TtlClass {
    #[serde(rename = "3d")]
    Days3,
    #[default]
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "90d")]
    Days90,
    #[serde(rename = "180d")]
    Days180,
    #[serde(rename = "365d")]
    Days365,
}

impl TtlClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Days3 => "3d",
            Self::Days7 => "7d",
            Self::Days30 => "30d",
            Self::Days90 => "90d",
            Self::Days180 => "180d",
            Self::Days365 => "365d",
        }
    }
}

impl fmt::Display for TtlClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing and retention attributes carried alongside a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantInfo {
    #[serde(default)]
    pub ttl: TtlClass,
    #[serde(default)]
    pub which_is_enough: i32,
    #[serde(default)]
    pub coze_account_id: String,
}

/// The unit written to the ingest topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceData {
    pub tenant: String,
    #[serde(default)]
    pub tenant_info: TenantInfo,
    #[serde(default)]
    pub spans: Vec<Span>,
}
