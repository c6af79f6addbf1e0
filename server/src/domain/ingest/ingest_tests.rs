use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::data::{GetTraceParam, MemoryObjectStore, TraceRepository};
use crate::data::broker::{ConsumerHandler, MemoryBrokerFactory, Message, MessageExt};
use crate::data::memory::MemoryTraceRepository;
use crate::core::trace_config::StaticTraceConfig;
use crate::domain::consumer::ConsumerRegistry;
use crate::domain::error::ErrorKind;
use crate::domain::normalize::{
    AnyValue, KeyValue, OtelSpan, ResourceSpans, ScopeSpans, WireNumber,
};

const TOPIC: &str = "trace_ingest";
const TENANT: &str = "spans_default";

fn config() -> Arc<StaticTraceConfig> {
    let json = r#"{
        "trace_mq_producer_config": {"topic": "trace_ingest", "producer_group": "pg"},
        "trace_tenant_cfg": [{"tenant": "spans_default", "consumer_group": "cg", "ttl": "30d"}],
        "trace_default_tenant": "spans_default",
        "trace_platform_span_handler_config": {
            "ingest_processors": {"spans_default": ["drop_invalid", "system_tags"]},
            "consume_processors": {}
        }
    }"#;
    Arc::new(StaticTraceConfig::from_json(json).unwrap())
}

fn service(factory: &MemoryBrokerFactory) -> IngestService {
    let config = config();
    let processors = ProcessorBuilder::new(config.clone(), Arc::new(MemoryObjectStore::new()));
    IngestService::new(config, Arc::new(factory.clone()), processors)
}

fn span(id: &str, input_len: usize) -> Span {
    Span {
        trace_id: "t1".to_string(),
        span_id: id.to_string(),
        workspace_id: "7".to_string(),
        start_time: 1_700_000_000_000_000,
        input: "x".repeat(input_len),
        ..Default::default()
    }
}

async fn wait_pending(factory: &MemoryBrokerFactory, n: usize) {
    for _ in 0..200 {
        if factory.pending(TOPIC, "unsubscribed") >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {n} pending messages");
}

#[test]
fn test_split_payloads_keeps_small_batch_whole() {
    let data = TraceData {
        tenant: TENANT.to_string(),
        tenant_info: TenantInfo::default(),
        spans: vec![span("a", 10), span("b", 10)],
    };
    let mut out = Vec::new();
    split_payloads(data, MAX_BATCH_SIZE_BYTES, &mut out).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].1, 2);
}

#[test]
fn test_split_payloads_one_message_per_span() {
    let data = TraceData {
        tenant: TENANT.to_string(),
        tenant_info: TenantInfo::default(),
        spans: vec![span("a", 600), span("b", 600)],
    };
    let mut out = Vec::new();
    split_payloads(data, 1500, &mut out).unwrap();
    assert_eq!(out.len(), 2);
    for (body, count) in &out {
        assert_eq!(*count, 1);
        assert!(body.len() <= 1500);
        let decoded: TraceData = serde_json::from_slice(body).unwrap();
        assert_eq!(decoded.tenant, TENANT);
        assert_eq!(decoded.spans.len(), 1);
    }
}

#[tokio::test]
async fn test_oversized_batch_is_split_and_sent() {
    let factory = MemoryBrokerFactory::new();
    let service = service(&factory).with_max_batch_bytes(1500);
    service
        .ingest(IngestRequest {
            tenant: TENANT.to_string(),
            spans: vec![span("a", 600), span("b", 600)],
            ..Default::default()
        })
        .await
        .unwrap();
    wait_pending(&factory, 2).await;
    assert_eq!(factory.pending(TOPIC, "unsubscribed"), 2);
    service.close().await;
}

#[tokio::test]
async fn test_single_oversized_span_is_rejected() {
    let factory = MemoryBrokerFactory::new();
    let service = service(&factory).with_max_batch_bytes(1500);
    let err = service
        .ingest(IngestRequest {
            tenant: TENANT.to_string(),
            spans: vec![span("a", 10), span("big", 4000)],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::InvalidArgument));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(factory.pending(TOPIC, "unsubscribed"), 0);
}

#[tokio::test]
async fn test_unknown_tenant_is_internal() {
    let factory = MemoryBrokerFactory::new();
    let err = service(&factory)
        .ingest(IngestRequest {
            tenant: "nope".to_string(),
            spans: vec![span("a", 1)],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::Internal));
}

#[tokio::test]
async fn test_empty_after_stages_sends_nothing() {
    let factory = MemoryBrokerFactory::new();
    let mut invalid = span("", 1);
    invalid.trace_id.clear();
    service(&factory)
        .ingest(IngestRequest {
            tenant: TENANT.to_string(),
            spans: vec![invalid],
            ..Default::default()
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(factory.pending(TOPIC, "unsubscribed"), 0);
}

fn otel_request() -> TraceRequest {
    let span = OtelSpan {
        trace_id: "0af7651916cd43dd8448eb211c80319c".to_string(),
        span_id: "b7ad6b7169203331".to_string(),
        name: "chat".to_string(),
        start_time_unix_nano: Some(WireNumber::Text("1700000000000000000".to_string())),
        end_time_unix_nano: Some(WireNumber::Text("1700000001000000000".to_string())),
        attributes: vec![
            KeyValue::new("gen_ai.request.model", AnyValue::string("gpt-4")),
            KeyValue::new("cozeloop.span_type", AnyValue::string("chat")),
        ],
        ..Default::default()
    };
    let dropped = OtelSpan::default();
    TraceRequest {
        resource_spans: vec![ResourceSpans {
            resource: None,
            scope_spans: vec![ScopeSpans {
                scope: None,
                spans: vec![span, dropped],
            }],
        }],
    }
}

#[tokio::test]
async fn test_ingest_otel_end_to_end() {
    let factory = MemoryBrokerFactory::new();
    let config = config();
    let store = Arc::new(MemoryObjectStore::new());
    let processors = ProcessorBuilder::new(config.clone(), store);
    let repository = Arc::new(MemoryTraceRepository::new());

    let registry = ConsumerRegistry::new(Arc::new(factory.clone()));
    registry
        .register(Arc::new(SpanConsumer::new(
            TENANT,
            config.clone(),
            repository.clone(),
            processors.clone(),
        )))
        .await;
    registry.start_all().await.unwrap();

    let service = IngestService::new(config, Arc::new(factory.clone()), processors);
    let accepted = service
        .ingest_otel(OtelIngestRequest {
            tenant: String::new(),
            workspace_id: "42".to_string(),
            ttl: None,
            request: otel_request(),
        })
        .await
        .unwrap();
    assert_eq!(accepted, 1);

    for _ in 0..200 {
        if repository.span_count(TENANT) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(repository.span_count(TENANT), 1);

    let stored = repository
        .get_trace(&GetTraceParam {
            tenants: vec![TENANT.to_string()],
            trace_id: "0af7651916cd43dd8448eb211c80319c".to_string(),
            start_time: 0,
            end_time: i64::MAX,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stored[0].workspace_id, "42");
    assert_eq!(stored[0].span_type, "model");
    assert_eq!(stored[0].system_tags_string["tenant"], TENANT);

    service.close().await;
    registry.close_all().await;
}

#[tokio::test]
async fn test_ingest_otel_proto_rejects_garbage() {
    let factory = MemoryBrokerFactory::new();
    let err = service(&factory)
        .ingest_otel_proto(TENANT.to_string(), "7".to_string(), None, &[0xff, 0xff])
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::InvalidArgument));
}

#[tokio::test]
async fn test_span_consumer_acks_undecodable_payload() {
    let config = config();
    let repository = Arc::new(MemoryTraceRepository::new());
    let consumer = SpanConsumer::new(
        TENANT,
        config.clone(),
        repository.clone(),
        ProcessorBuilder::new(config, Arc::new(MemoryObjectStore::new())),
    );
    let msg = MessageExt {
        message: Message::new(TOPIC, b"not json".to_vec()),
        message_id: "1".to_string(),
        reconsume_times: 0,
    };
    assert!(consumer.handle_message(&msg).await.is_ok());
    assert_eq!(repository.span_count(TENANT), 0);
}

#[test]
fn test_span_consumer_config_uses_tenant_record() {
    let config = config();
    let consumer = SpanConsumer::new(
        TENANT,
        config.clone(),
        Arc::new(MemoryTraceRepository::new()),
        ProcessorBuilder::new(config, Arc::new(MemoryObjectStore::new())),
    );
    let cfg = crate::domain::consumer::ConsumerConfigProvider::consumer_config(&consumer).unwrap();
    assert_eq!(cfg.topic, TOPIC);
    assert_eq!(cfg.consumer_group, "cg");
}

#[tokio::test]
async fn test_client_system_tags_dropped_without_stages() {
    let json = r#"{
        "trace_mq_producer_config": {"topic": "trace_ingest", "producer_group": "pg"},
        "trace_tenant_cfg": [{"tenant": "spans_default", "consumer_group": "cg", "ttl": "30d"}],
        "trace_platform_span_handler_config": {}
    }"#;
    let config = Arc::new(StaticTraceConfig::from_json(json).unwrap());
    let factory = MemoryBrokerFactory::new();
    let processors = ProcessorBuilder::new(config.clone(), Arc::new(MemoryObjectStore::new()));
    let repository = Arc::new(MemoryTraceRepository::new());

    let registry = ConsumerRegistry::new(Arc::new(factory.clone()));
    registry
        .register(Arc::new(SpanConsumer::new(
            TENANT,
            config.clone(),
            repository.clone(),
            processors.clone(),
        )))
        .await;
    registry.start_all().await.unwrap();

    let mut forged = span("a", 10);
    forged
        .system_tags_string
        .insert("injected".to_string(), "x".to_string());
    forged
        .system_tags_string
        .insert("input_tos_key".to_string(), "other_tenant/secret".to_string());
    forged
        .system_tags_string
        .insert("tenant".to_string(), "other_tenant".to_string());

    let service = IngestService::new(config, Arc::new(factory.clone()), processors);
    service
        .ingest(IngestRequest {
            tenant: TENANT.to_string(),
            spans: vec![forged],
            ..Default::default()
        })
        .await
        .unwrap();

    for _ in 0..200 {
        if repository.span_count(TENANT) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stored = repository
        .get_trace(&GetTraceParam {
            tenants: vec![TENANT.to_string()],
            trace_id: "t1".to_string(),
            start_time: 0,
            end_time: i64::MAX,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    let tags = &stored[0].system_tags_string;
    assert_eq!(tags.len(), 1);
    assert_eq!(tags["tenant"], TENANT);

    service.close().await;
    registry.close_all().await;
}
