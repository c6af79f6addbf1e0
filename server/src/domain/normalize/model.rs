//! OTLP/JSON trace request model
//!
//! IDs are hex strings and timestamps are string-encoded nanoseconds (plain
//! numbers are accepted too). Protobuf requests are converted into this shape
//! by the `pb` adapter.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::value::AttrValue;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRequest {
    #[serde(default)]
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    #[serde(default)]
    pub resource: Option<Resource>,
    #[serde(default)]
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSpans {
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub spans: Vec<OtelSpan>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtelSpan {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: i32,
    #[serde(default)]
    pub start_time_unix_nano: Option<WireNumber>,
    #[serde(default)]
    pub end_time_unix_nano: Option<WireNumber>,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    #[serde(default)]
    pub status: Option<SpanStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub time_unix_nano: Option<WireNumber>,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

/// OTel status code: 0 unset, 1 ok, 2 error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

pub const STATUS_CODE_ERROR: i32 = 2;

/// A 64-bit integer sent either as a JSON number or a decimal string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Number(i64),
    Text(String),
}

impl WireNumber {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: Option<AnyValue>,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: AnyValue) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }
}

/// OTLP/JSON `AnyValue`: exactly one field is expected to be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_value: Option<WireNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double_value: Option<WireDouble>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_value: Option<ArrayValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kvlist_value: Option<KvListValue>,
    /// Base64, as in the OTLP/JSON mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireDouble {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    #[serde(default)]
    pub values: Vec<AnyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvListValue {
    #[serde(default)]
    pub values: Vec<KeyValue>,
}

impl AnyValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self {
            string_value: Some(s.into()),
            ..Default::default()
        }
    }

    pub fn int(v: i64) -> Self {
        Self {
            int_value: Some(WireNumber::Number(v)),
            ..Default::default()
        }
    }

    pub fn double(v: f64) -> Self {
        Self {
            double_value: Some(WireDouble::Number(v)),
            ..Default::default()
        }
    }

    pub fn bool(v: bool) -> Self {
        Self {
            bool_value: Some(v),
            ..Default::default()
        }
    }

    /// The typed value, or `None` when no known variant is set or it does not decode
    pub fn to_attr(&self) -> Option<AttrValue> {
        if let Some(s) = &self.string_value {
            return Some(AttrValue::String(s.clone()));
        }
        if let Some(b) = self.bool_value {
            return Some(AttrValue::Bool(b));
        }
        if let Some(i) = &self.int_value {
            return i.as_i64().map(AttrValue::Int);
        }
        if let Some(d) = &self.double_value {
            return match d {
                WireDouble::Number(v) => Some(AttrValue::Double(*v)),
                WireDouble::Text(s) => s.trim().parse().ok().map(AttrValue::Double),
            };
        }
        if let Some(arr) = &self.array_value {
            return Some(AttrValue::Array(
                arr.values.iter().filter_map(AnyValue::to_attr).collect(),
            ));
        }
        if let Some(kv) = &self.kvlist_value {
            return Some(AttrValue::KvList(
                kv.values
                    .iter()
                    .filter_map(|kv| Some((kv.key.clone(), kv.value.as_ref()?.to_attr()?)))
                    .collect(),
            ));
        }
        if let Some(b) = &self.bytes_value {
            return STANDARD.decode(b).ok().map(AttrValue::Bytes);
        }
        None
    }
}

/// One span together with the resource and scope it was reported under
#[derive(Debug, Clone, Copy)]
pub struct ResourceScopeSpan<'a> {
    pub resource: &'a [KeyValue],
    pub scope: Option<&'a Scope>,
    pub span: &'a OtelSpan,
}

impl TraceRequest {
    pub fn resource_scope_spans(&self) -> Vec<ResourceScopeSpan<'_>> {
        let mut out = Vec::new();
        for rs in &self.resource_spans {
            let resource = rs
                .resource
                .as_ref()
                .map(|r| r.attributes.as_slice())
                .unwrap_or(&[]);
            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    out.push(ResourceScopeSpan {
                        resource,
                        scope: ss.scope.as_ref(),
                        span,
                    });
                }
            }
        }
        out
    }

    pub fn span_count(&self) -> usize {
        self.resource_spans
            .iter()
            .flat_map(|rs| &rs.scope_spans)
            .map(|ss| ss.spans.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_otlp_json() {
        let json = r#"{
            "resourceSpans": [{
                "resource": {"attributes": [
                    {"key": "telemetry.sdk.language", "value": {"stringValue": "python"}}
                ]},
                "scopeSpans": [{
                    "scope": {"name": "cozeloop", "version": "0.1"},
                    "spans": [{
                        "traceId": "0af7651916cd43dd8448eb211c80319c",
                        "spanId": "b7ad6b7169203331",
                        "name": "chat",
                        "startTimeUnixNano": "1700000000000000000",
                        "endTimeUnixNano": 1700000001000000000,
                        "attributes": [
                            {"key": "n", "value": {"intValue": "12"}},
                            {"key": "d", "value": {"doubleValue": 0.5}},
                            {"key": "a", "value": {"arrayValue": {"values": [{"stringValue": "x"}]}}},
                            {"key": "weird", "value": {}}
                        ]
                    }]
                }]
            }]
        }"#;
        let req: TraceRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.span_count(), 1);
        let rss = req.resource_scope_spans();
        let span = rss[0].span;
        assert_eq!(
            span.start_time_unix_nano.as_ref().and_then(WireNumber::as_i64),
            Some(1_700_000_000_000_000_000)
        );
        assert_eq!(
            span.end_time_unix_nano.as_ref().and_then(WireNumber::as_i64),
            Some(1_700_000_001_000_000_000)
        );
        let attrs: Vec<_> = span
            .attributes
            .iter()
            .map(|kv| kv.value.as_ref().and_then(AnyValue::to_attr))
            .collect();
        assert_eq!(attrs[0], Some(AttrValue::Int(12)));
        assert_eq!(attrs[1], Some(AttrValue::Double(0.5)));
        assert_eq!(
            attrs[2],
            Some(AttrValue::Array(vec![AttrValue::String("x".to_string())]))
        );
        assert_eq!(attrs[3], None);
        assert_eq!(rss[0].scope.unwrap().name, "cozeloop");
    }

    #[test]
    fn test_bytes_value_is_base64() {
        let v = AnyValue {
            bytes_value: Some("AQI=".to_string()),
            ..Default::default()
        };
        assert_eq!(v.to_attr(), Some(AttrValue::Bytes(vec![1, 2])));
    }
}
