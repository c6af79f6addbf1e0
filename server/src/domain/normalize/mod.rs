//! Span normalizer
//!
//! Folds the three inbound conventions into the canonical [`Span`]:
//! - CozeLoop `cozeloop.*` attributes
//! - OpenTelemetry GenAI `gen_ai.*` attributes and events
//! - OpenInference `input.value`, `llm.*`, `openinference.span.kind`
//!
//! Each canonical field is resolved through the driver table in `table`:
//! exact keys first, then prefix aggregation, then span events, a later source
//! overriding an earlier one. Attributes no descriptor claims are copied into
//! the tag bag matching their wire type.
//!
//! The normalizer is stateless. One bad span never fails a batch: it either
//! yields a span or `None`.

mod aggregate;
mod derive;
mod model;
mod openinference;
pub mod pb;
mod table;
mod value;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value as JsonValue};

pub use derive::ModelCallOption;
pub use model::{
    AnyValue, KeyValue, OtelSpan, Resource, ResourceScopeSpan, ResourceSpans, Scope, ScopeSpans,
    SpanEvent, SpanStatus, TraceRequest, WireNumber,
};
pub use value::AttrValue;

use aggregate::{aggregate, apply_wraps};
use derive::Runtime;
use table::{
    Convert, DRIVER_TABLE, DataType, FieldDescriptor, GEN_AI_FUNCTIONS_PREFIX,
    OPENINFERENCE_TOOLS_PREFIX, RESOURCE_SDK_LANGUAGE, RESOURCE_SDK_VERSION, has_prefix,
};

use crate::data::types::{
    COL_CALL_TYPE, COL_INPUT, COL_OUTPUT, COL_SPAN_TYPE, COL_WORKSPACE_ID, SPAN_TYPE_CUSTOM,
    SPAN_TYPE_MODEL, SPAN_TYPE_RETRIEVER, SPAN_TYPE_TOOL, Span, TAG_MODEL_NAME, TagValue,
};

static UNKNOWN_VALUE_LOGGED: AtomicBool = AtomicBool::new(false);

/// Normalize every span of a request, dropping the ones that yield `None`
pub fn normalize_request(req: &TraceRequest) -> Vec<Span> {
    req.resource_scope_spans()
        .iter()
        .filter_map(normalize)
        .collect()
}

/// Normalize one span; `None` when it is structurally unusable
pub fn normalize(rss: &ResourceScopeSpan<'_>) -> Option<Span> {
    let otel = rss.span;
    if otel.trace_id.is_empty() && otel.span_id.is_empty() {
        tracing::debug!("Dropping span without trace and span id");
        return None;
    }
    let (start_time, duration) = span_times(otel)?;

    let attrs = typed_attributes(&otel.attributes);
    let lookup: HashMap<&str, &AttrValue> = attrs.iter().map(|(k, v)| (*k, v)).collect();

    let mut span = Span {
        trace_id: otel.trace_id.clone(),
        span_id: otel.span_id.clone(),
        parent_id: otel.parent_span_id.clone(),
        span_name: otel.name.clone(),
        start_time,
        duration,
        ..Default::default()
    };

    let table = &*DRIVER_TABLE;
    for (key, value) in &attrs {
        if !table.is_registered(key) {
            span.set_tag(*key, value.to_wire_tag());
        }
    }

    for field in &table.fields {
        if let Some(resolved) = resolve_field(field, &attrs, &lookup, otel) {
            write_field(&mut span, field, resolved);
        }
    }

    attach_tools(&mut span, &attrs);
    span.span_type = canonical_span_type(&span.span_type, span.tags_string.contains_key(TAG_MODEL_NAME));

    derive::derive(&mut span, otel.status.as_ref(), &runtime(rss));
    Some(span)
}

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Start time and duration in microseconds
fn span_times(otel: &OtelSpan) -> Option<(i64, i64)> {
    let start = otel.start_time_unix_nano.as_ref().and_then(WireNumber::as_i64);
    let end = otel.end_time_unix_nano.as_ref().and_then(WireNumber::as_i64);
    let (start, end) = match (start, end) {
        (None, None) => {
            tracing::warn!(span_id = %otel.span_id, "Dropping span with unparseable timestamps");
            return None;
        }
        (Some(s), Some(e)) => (s, e),
        (s, e) => {
            tracing::warn!(span_id = %otel.span_id, "Span has an unparseable timestamp, using zero");
            (s.unwrap_or(0), e.unwrap_or(0))
        }
    };
    let start = start / 1_000;
    let end = end / 1_000;
    Some((start, (end - start).max(0)))
}

// ============================================================================
// FIELD RESOLUTION
// ============================================================================

enum Resolved {
    Attr(AttrValue),
    Json(JsonValue),
}

fn typed_attributes(kvs: &[KeyValue]) -> Vec<(&str, AttrValue)> {
    kvs.iter()
        .filter_map(|kv| {
            let value = kv.value.as_ref().and_then(AnyValue::to_attr);
            if value.is_none() && !UNKNOWN_VALUE_LOGGED.swap(true, Ordering::Relaxed) {
                tracing::warn!(key = %kv.key, "Dropping attribute with unknown value variant");
            }
            Some((kv.key.as_str(), value?))
        })
        .collect()
}

fn prefixed<'a>(attrs: &'a [(&'a str, AttrValue)], prefix: &str) -> Vec<(&'a str, &'a AttrValue)> {
    attrs
        .iter()
        .filter(|(k, _)| has_prefix(k, prefix))
        .map(|(k, v)| (&k[prefix.len() + 1..], v))
        .collect()
}

fn resolve_field(
    field: &FieldDescriptor,
    attrs: &[(&str, AttrValue)],
    lookup: &HashMap<&str, &AttrValue>,
    otel: &OtelSpan,
) -> Option<Resolved> {
    let mut resolved = field
        .exact_keys
        .iter()
        .find_map(|k| lookup.get(k))
        .map(|v| Resolved::Attr((*v).clone()));

    for rule in &field.prefixes {
        let entries = prefixed(attrs, rule.prefix);
        if entries.is_empty() {
            continue;
        }
        let tree = aggregate(&entries);
        let value = match rule.convert {
            Convert::Wrap(wraps) => apply_wraps(tree, wraps),
            Convert::OpenInferenceInput => openinference::convert_input(tree),
            Convert::OpenInferenceOutput => openinference::convert_output(tree),
        };
        resolved = Some(Resolved::Json(value));
        break;
    }

    if let Some(rule) = &field.events {
        let matching = otel.events.iter().filter(|e| rule.names.contains(&e.name.as_str()));
        match rule.attr {
            Some(attr) => {
                let last = matching
                    .filter_map(|e| {
                        e.attributes
                            .iter()
                            .find(|kv| kv.key == attr)
                            .and_then(|kv| kv.value.as_ref()?.to_attr())
                    })
                    .last();
                if let Some(v) = last {
                    resolved = Some(Resolved::Attr(v));
                }
            }
            None => {
                let items: Vec<JsonValue> = matching
                    .map(|e| {
                        let typed = typed_attributes(&e.attributes);
                        let entries: Vec<(&str, &AttrValue)> =
                            typed.iter().map(|(k, v)| (*k, v)).collect();
                        aggregate(&entries)
                    })
                    .collect();
                if !items.is_empty() {
                    resolved = Some(Resolved::Json(apply_wraps(
                        JsonValue::Array(items),
                        rule.wrap,
                    )));
                }
            }
        }
    }

    resolved
}

fn resolved_string(resolved: Resolved) -> String {
    match resolved {
        Resolved::Attr(v) => v.as_string(),
        Resolved::Json(JsonValue::String(s)) => s,
        Resolved::Json(v) => v.to_string(),
    }
}

fn write_field(span: &mut Span, field: &FieldDescriptor, resolved: Resolved) {
    if !field.is_tag {
        let value = resolved_string(resolved);
        match field.name {
            COL_WORKSPACE_ID => span.workspace_id = value,
            COL_SPAN_TYPE => span.span_type = value,
            COL_CALL_TYPE => span.call_type = value,
            COL_INPUT => span.input = value,
            COL_OUTPUT => span.output = value,
            other => tracing::debug!(field = other, "No column for field"),
        }
        return;
    }

    let tag = match field.data_type {
        DataType::String => Some(TagValue::String(resolved_string(resolved))),
        DataType::Long => match resolved {
            Resolved::Attr(v) => v.as_i64(),
            Resolved::Json(v) => v.as_i64(),
        }
        .map(TagValue::Long),
        DataType::Double => match resolved {
            Resolved::Attr(v) => v.as_f64(),
            Resolved::Json(v) => v.as_f64(),
        }
        .map(TagValue::Double),
        DataType::ArrayString => {
            let items = match resolved {
                Resolved::Attr(v) => v.as_string_array(),
                Resolved::Json(JsonValue::Array(items)) => items
                    .into_iter()
                    .map(|v| match v {
                        JsonValue::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
                Resolved::Json(other) => vec![other.to_string()],
            };
            serde_json::to_string(&items).ok().map(TagValue::String)
        }
    };

    match tag {
        Some(tag) => span.set_tag(field.name, tag),
        None => tracing::debug!(
            field = field.name,
            span_id = %span.span_id,
            "Attribute does not convert to the field type, skipping"
        ),
    }
}

/// Attach tool definitions under the model input's `tools` key
fn attach_tools(span: &mut Span, attrs: &[(&str, AttrValue)]) {
    let mut tools = Vec::new();
    let functions = prefixed(attrs, GEN_AI_FUNCTIONS_PREFIX);
    if !functions.is_empty() {
        tools.extend(openinference::convert_gen_ai_functions(aggregate(&functions)));
    }
    let oi_tools = prefixed(attrs, OPENINFERENCE_TOOLS_PREFIX);
    if !oi_tools.is_empty() {
        tools.extend(openinference::convert_openinference_tools(aggregate(&oi_tools)));
    }
    if tools.is_empty() {
        return;
    }

    let mut input = if span.input.is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<JsonValue>(&span.input) {
            Ok(JsonValue::Object(map)) => map,
            _ => {
                tracing::debug!(span_id = %span.span_id, "Input is not an object, tools not attached");
                return;
            }
        }
    };
    input.insert("tools".to_string(), JsonValue::Array(tools));
    span.input = JsonValue::Object(input).to_string();
}

// ============================================================================
// SPAN TYPE AND RUNTIME
// ============================================================================

/// Map inbound span kinds onto the canonical set
pub fn canonical_span_type(raw: &str, has_model: bool) -> String {
    match raw {
        "" if has_model => SPAN_TYPE_MODEL,
        "" => SPAN_TYPE_CUSTOM,
        "chat" | "generate_content" | "text_completion" | "LLM" => SPAN_TYPE_MODEL,
        "execute_tool" | "TOOL" => SPAN_TYPE_TOOL,
        "RETRIEVER" => SPAN_TYPE_RETRIEVER,
        other => other,
    }
    .to_string()
}

fn runtime(rss: &ResourceScopeSpan<'_>) -> Runtime {
    let resource = |key: &str| {
        rss.resource
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.as_ref()?.to_attr())
            .map(|v| v.as_string())
            .unwrap_or_default()
    };
    Runtime {
        language: resource(RESOURCE_SDK_LANGUAGE),
        sdk_version: resource(RESOURCE_SDK_VERSION),
        scope_name: rss.scope.map(|s| s.name.clone()).unwrap_or_default(),
        scope_version: rss.scope.map(|s| s.version.clone()).unwrap_or_default(),
    }
}
