//! Protobuf to OTLP/JSON adapter
//!
//! IDs are hex-encoded, timestamps stringified and bytes base64-encoded, so
//! the normalizer only ever sees the JSON shape.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{
    AnyValue as PbAnyValue, KeyValue as PbKeyValue, any_value,
};
use opentelemetry_proto::tonic::trace::v1::{Span as PbSpan, span::Event as PbEvent};
use prost::Message as _;

use super::model::{
    AnyValue, ArrayValue, KeyValue, KvListValue, OtelSpan, Resource, ResourceSpans, Scope,
    ScopeSpans, SpanEvent, SpanStatus, TraceRequest, WireDouble, WireNumber,
};

/// Decode a binary OTLP export request
pub fn decode(bytes: &[u8]) -> Result<TraceRequest, prost::DecodeError> {
    ExportTraceServiceRequest::decode(bytes).map(|req| convert(&req))
}

pub fn convert(req: &ExportTraceServiceRequest) -> TraceRequest {
    TraceRequest {
        resource_spans: req
            .resource_spans
            .iter()
            .map(|rs| ResourceSpans {
                resource: rs.resource.as_ref().map(|r| Resource {
                    attributes: convert_attributes(&r.attributes),
                }),
                scope_spans: rs
                    .scope_spans
                    .iter()
                    .map(|ss| ScopeSpans {
                        scope: ss.scope.as_ref().map(|s| Scope {
                            name: s.name.clone(),
                            version: s.version.clone(),
                        }),
                        spans: ss.spans.iter().map(convert_span).collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn convert_span(span: &PbSpan) -> OtelSpan {
    OtelSpan {
        trace_id: hex::encode(&span.trace_id),
        span_id: hex::encode(&span.span_id),
        parent_span_id: hex::encode(&span.parent_span_id),
        name: span.name.clone(),
        kind: span.kind,
        start_time_unix_nano: Some(WireNumber::Text(span.start_time_unix_nano.to_string())),
        end_time_unix_nano: Some(WireNumber::Text(span.end_time_unix_nano.to_string())),
        attributes: convert_attributes(&span.attributes),
        events: span.events.iter().map(convert_event).collect(),
        status: span.status.as_ref().map(|s| SpanStatus {
            code: s.code,
            message: s.message.clone(),
        }),
    }
}

fn convert_event(event: &PbEvent) -> SpanEvent {
    SpanEvent {
        name: event.name.clone(),
        time_unix_nano: Some(WireNumber::Text(event.time_unix_nano.to_string())),
        attributes: convert_attributes(&event.attributes),
    }
}

fn convert_attributes(attrs: &[PbKeyValue]) -> Vec<KeyValue> {
    attrs
        .iter()
        .map(|kv| KeyValue {
            key: kv.key.clone(),
            value: kv.value.as_ref().map(convert_value),
        })
        .collect()
}

fn convert_value(value: &PbAnyValue) -> AnyValue {
    let mut out = AnyValue::default();
    match &value.value {
        Some(any_value::Value::StringValue(s)) => out.string_value = Some(s.clone()),
        Some(any_value::Value::BoolValue(b)) => out.bool_value = Some(*b),
        Some(any_value::Value::IntValue(i)) => {
            out.int_value = Some(WireNumber::Text(i.to_string()));
        }
        Some(any_value::Value::DoubleValue(d)) => out.double_value = Some(WireDouble::Number(*d)),
        Some(any_value::Value::ArrayValue(arr)) => {
            out.array_value = Some(ArrayValue {
                values: arr.values.iter().map(convert_value).collect(),
            });
        }
        Some(any_value::Value::KvlistValue(kv)) => {
            out.kvlist_value = Some(KvListValue {
                values: convert_attributes(&kv.values),
            });
        }
        Some(any_value::Value::BytesValue(b)) => out.bytes_value = Some(STANDARD.encode(b)),
        None => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::normalize::value::AttrValue;
    use opentelemetry_proto::tonic::trace::v1::{
        ResourceSpans as PbResourceSpans, ScopeSpans as PbScopeSpans,
    };
    use prost::Message;

    fn pb_request() -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![PbResourceSpans {
                scope_spans: vec![PbScopeSpans {
                    spans: vec![PbSpan {
                        trace_id: vec![0xab; 16],
                        span_id: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
                        name: "chat".to_string(),
                        start_time_unix_nano: 1_700_000_000_000_000_000,
                        end_time_unix_nano: 1_700_000_000_500_000_000,
                        attributes: vec![
                            PbKeyValue {
                                key: "gen_ai.usage.input_tokens".to_string(),
                                value: Some(PbAnyValue {
                                    value: Some(any_value::Value::IntValue(12)),
                                }),
                            },
                            PbKeyValue {
                                key: "blob".to_string(),
                                value: Some(PbAnyValue {
                                    value: Some(any_value::Value::BytesValue(vec![1, 2])),
                                }),
                            },
                        ],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_convert_encodes_ids_and_times() {
        let req = convert(&pb_request());
        let span = &req.resource_spans[0].scope_spans[0].spans[0];
        assert_eq!(span.trace_id, "ab".repeat(16));
        assert_eq!(span.span_id, "0102030405060708");
        assert_eq!(span.parent_span_id, "");
        assert_eq!(
            span.start_time_unix_nano,
            Some(WireNumber::Text("1700000000000000000".to_string()))
        );
        assert_eq!(
            span.attributes[0].value.as_ref().and_then(AnyValue::to_attr),
            Some(AttrValue::Int(12))
        );
        assert_eq!(
            span.attributes[1].value.as_ref().and_then(AnyValue::to_attr),
            Some(AttrValue::Bytes(vec![1, 2]))
        );
    }

    #[test]
    fn test_decode_binary() {
        let bytes = pb_request().encode_to_vec();
        let req = decode(&bytes).unwrap();
        assert_eq!(req.span_count(), 1);
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
