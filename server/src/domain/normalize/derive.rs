//! Post-assembly derivations
//!
//! Run once every field has landed, in a fixed order: first-response latency,
//! token total, packed call options, status remap, runtime, log id.

use serde::Serialize;

use super::model::{STATUS_CODE_ERROR, SpanStatus};
use super::table::{
    FIELD_FREQUENCY_PENALTY, FIELD_MAX_TOKENS, FIELD_PRESENCE_PENALTY, FIELD_STOP_SEQUENCES,
    FIELD_TEMPERATURE, FIELD_TOP_K, FIELD_TOP_P,
};
use crate::data::types::{
    SYSTEM_TAG_RUNTIME, Span, TAG_CALL_OPTIONS, TAG_ERROR, TAG_INPUT_TOKENS,
    TAG_LATENCY_FIRST_RESP, TAG_LOGID, TAG_OUTPUT_TOKENS, TAG_START_TIME_FIRST_RESP, TAG_TOKENS,
    TagValue,
};

/// Model call parameters packed into the `call_options` tag
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct ModelCallOption {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

impl ModelCallOption {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Runtime facts serialized into `system_tags_string["runtime"]`
#[derive(Debug, Default, Serialize)]
pub struct Runtime {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sdk_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope_version: String,
}

impl Runtime {
    fn is_empty(&self) -> bool {
        self.language.is_empty()
            && self.sdk_version.is_empty()
            && self.scope_name.is_empty()
            && self.scope_version.is_empty()
    }
}

pub fn derive(span: &mut Span, status: Option<&SpanStatus>, runtime: &Runtime) {
    derive_latency_first_resp(span);
    derive_tokens(span);
    pack_call_options(span);
    remap_status(span, status);
    derive_runtime(span, runtime);
    promote_log_id(span);
}

fn derive_latency_first_resp(span: &mut Span) {
    if let Some(&first) = span.tags_long.get(TAG_START_TIME_FIRST_RESP)
        && first > 0
    {
        span.set_tag(TAG_LATENCY_FIRST_RESP, TagValue::Long(first - span.start_time));
    }
}

fn derive_tokens(span: &mut Span) {
    let input = span.tags_long.get(TAG_INPUT_TOKENS).copied();
    let output = span.tags_long.get(TAG_OUTPUT_TOKENS).copied();
    if input.is_none() && output.is_none() {
        return;
    }
    let total = input.unwrap_or(0).saturating_add(output.unwrap_or(0));
    span.set_tag(TAG_TOKENS, TagValue::Long(total));
}

fn take_double(span: &mut Span, key: &str) -> Option<f64> {
    match span.remove_tag(key)? {
        TagValue::Double(v) => Some(v),
        TagValue::Long(v) => Some(v as f64),
        other => {
            span.set_tag(key, other);
            None
        }
    }
}

fn take_long(span: &mut Span, key: &str) -> Option<i64> {
    match span.remove_tag(key)? {
        TagValue::Long(v) => Some(v),
        other => {
            span.set_tag(key, other);
            None
        }
    }
}

fn take_string_array(span: &mut Span, key: &str) -> Option<Vec<String>> {
    match span.remove_tag(key)? {
        TagValue::String(s) => match serde_json::from_str::<Vec<String>>(&s) {
            Ok(items) => Some(items),
            Err(_) => {
                span.set_tag(key, TagValue::String(s));
                None
            }
        },
        other => {
            span.set_tag(key, other);
            None
        }
    }
}

/// Move the individual call parameters out of their bags into one JSON tag
fn pack_call_options(span: &mut Span) {
    let options = ModelCallOption {
        temperature: take_double(span, FIELD_TEMPERATURE),
        max_tokens: take_long(span, FIELD_MAX_TOKENS),
        top_p: take_double(span, FIELD_TOP_P),
        top_k: take_long(span, FIELD_TOP_K),
        stop: take_string_array(span, FIELD_STOP_SEQUENCES),
        frequency_penalty: take_double(span, FIELD_FREQUENCY_PENALTY),
        presence_penalty: take_double(span, FIELD_PRESENCE_PENALTY),
    };
    if options.is_empty() {
        return;
    }
    match serde_json::to_string(&options) {
        Ok(json) => span.set_tag(TAG_CALL_OPTIONS, TagValue::String(json)),
        Err(e) => tracing::warn!(error = %e, span_id = %span.span_id, "Failed to pack call options"),
    }
}

fn remap_status(span: &mut Span, status: Option<&SpanStatus>) {
    if let Some(status) = status
        && status.code == STATUS_CODE_ERROR
    {
        span.status_code = STATUS_CODE_ERROR;
        if !status.message.is_empty() && !span.tags_string.contains_key(TAG_ERROR) {
            span.set_tag(TAG_ERROR, TagValue::String(status.message.clone()));
        }
    }
    if span.tags_string.contains_key(TAG_ERROR) && span.status_code == 0 {
        span.status_code = -1;
    }
}

fn derive_runtime(span: &mut Span, runtime: &Runtime) {
    if runtime.is_empty() {
        return;
    }
    match serde_json::to_string(runtime) {
        Ok(json) => {
            span.system_tags_string
                .insert(SYSTEM_TAG_RUNTIME.to_string(), json);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to serialize runtime"),
    }
}

fn promote_log_id(span: &mut Span) {
    if let Some(log_id) = span.tags_string.remove(TAG_LOGID)
        && span.log_id.is_empty()
    {
        span.log_id = log_id;
    }
}
