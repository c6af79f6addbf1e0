use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::core::constants::ANNOTATION_EVENT_DEFER_SECS;
use crate::core::trace_config::StaticTraceConfig;
use crate::data::ListAnnotationsParam;
use crate::data::broker::{ConsumerHandler, MemoryBrokerFactory, Message, MessageExt};
use crate::data::memory::MemoryTraceRepository;
use crate::data::types::TtlClass;
use crate::domain::consumer::{ConsumerConfigProvider, ConsumerRegistry};
use crate::domain::error::ErrorKind;

const TENANT: &str = "spans_default";
const TOPIC: &str = "trace_annotation";
const SPAN_START: i64 = 1_700_000_000_000_000;

fn config() -> Arc<StaticTraceConfig> {
    let json = r#"{
        "trace_platform_tenants": {"cozeloop": ["spans_default"]},
        "annotation_mq_producer_config": {"topic": "trace_annotation", "producer_group": "apg"},
        "annotation_mq_consumer_config": {"topic": "trace_annotation", "consumer_group": "acg"},
        "annotation_source_config": {
            "evaluator": {"tenants": ["spans_default"], "annotation_type": "auto_evaluator"}
        }
    }"#;
    Arc::new(StaticTraceConfig::from_json(json).unwrap())
}

struct Fixture {
    factory: MemoryBrokerFactory,
    config: Arc<StaticTraceConfig>,
    repository: Arc<MemoryTraceRepository>,
    producer: Arc<AnnotationProducer>,
    service: AnnotationService,
}

fn fixture() -> Fixture {
    let factory = MemoryBrokerFactory::new();
    let config = config();
    let repository = Arc::new(MemoryTraceRepository::new());
    let producer = Arc::new(AnnotationProducer::new(
        config.clone(),
        Arc::new(factory.clone()),
    ));
    let service = AnnotationService::new(config.clone(), repository.clone(), producer.clone());
    Fixture {
        factory,
        config,
        repository,
        producer,
        service,
    }
}

fn span(start_time: i64) -> Span {
    Span {
        trace_id: "t1".to_string(),
        span_id: "s1".to_string(),
        workspace_id: "7".to_string(),
        start_time,
        ..Default::default()
    }
}

async fn seed(repository: &MemoryTraceRepository, start_time: i64) {
    repository
        .insert_spans(TENANT, TtlClass::Days7, &[span(start_time)])
        .await
        .unwrap();
}

fn manual_target(user: &str) -> ManualAnnotationTarget {
    ManualAnnotationTarget {
        platform: PlatformType::Cozeloop,
        workspace_id: "7".to_string(),
        trace_id: "t1".to_string(),
        span_id: "s1".to_string(),
        start_time: SPAN_START + 500_000,
        user_id: user.to_string(),
    }
}

fn manual_request(user: &str, value: &str) -> ManualAnnotationRequest {
    ManualAnnotationRequest {
        target: manual_target(user),
        annotation_type: AnnotationType::ManualFeedback,
        key: "score".to_string(),
        value: AnnotationValue::String(value.to_string()),
        reasoning: String::new(),
    }
}

async fn listed(repository: &MemoryTraceRepository, include_deleted: bool) -> Vec<Annotation> {
    repository
        .list_annotations(&ListAnnotationsParam {
            tenants: vec![TENANT.to_string()],
            trace_id: "t1".to_string(),
            start_time: 0,
            end_time: i64::MAX,
            include_deleted,
            ..Default::default()
        })
        .await
        .unwrap()
}

fn evaluator_request() -> AnnotationRequest {
    AnnotationRequest {
        caller: "evaluator".to_string(),
        workspace_id: "7".to_string(),
        trace_id: "t1".to_string(),
        span_id: "s1".to_string(),
        key: "accuracy".to_string(),
        value: AnnotationValue::String("good".to_string()),
        user_id: "eval-bot".to_string(),
        query_days: 1,
        ..Default::default()
    }
}

fn event_message(event: &AnnotationEvent) -> MessageExt {
    MessageExt {
        message: Message::new(TOPIC, serde_json::to_vec(event).unwrap()),
        message_id: "m1".to_string(),
        reconsume_times: 0,
    }
}

// ============================================================================
// MANUAL
// ============================================================================

#[tokio::test]
async fn test_manual_annotation_binds_to_stored_start_time() {
    let fx = fixture();
    seed(&fx.repository, SPAN_START).await;

    let id = fx
        .service
        .create_manual_annotation(manual_request("alice", "great"))
        .await
        .unwrap();

    let rows = listed(&fx.repository, false).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].start_time, SPAN_START);
    assert_eq!(rows[0].created_by, "alice");
}

#[tokio::test]
async fn test_manual_annotation_requires_stored_span() {
    let fx = fixture();
    seed(&fx.repository, SPAN_START + 5_000_000).await;

    let err = fx
        .service
        .create_manual_annotation(manual_request("alice", "great"))
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::InvalidArgument));
    assert_eq!(fx.repository.annotation_count(TENANT), 0);
}

#[tokio::test]
async fn test_manual_annotation_rejects_other_workspace() {
    let fx = fixture();
    seed(&fx.repository, SPAN_START).await;

    let mut req = manual_request("alice", "great");
    req.target.workspace_id = "8".to_string();
    let err = fx.service.create_manual_annotation(req).await.unwrap_err();
    assert!(err.is(ErrorKind::InvalidArgument));
}

#[tokio::test]
async fn test_update_keeps_original_author() {
    let fx = fixture();
    seed(&fx.repository, SPAN_START).await;
    let id = fx
        .service
        .create_manual_annotation(manual_request("alice", "great"))
        .await
        .unwrap();

    fx.service
        .update_manual_annotation(&id, manual_request("bob", "meh"))
        .await
        .unwrap();

    let rows = listed(&fx.repository, false).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].created_by, "alice");
    assert_eq!(rows[0].updated_by, "bob");
    assert_eq!(rows[0].value, AnnotationValue::String("meh".to_string()));
}

#[tokio::test]
async fn test_repeated_create_leaves_row_untouched() {
    let fx = fixture();
    seed(&fx.repository, SPAN_START).await;

    let first = fx
        .service
        .create_manual_annotation(manual_request("u1", "good"))
        .await
        .unwrap();
    let before = listed(&fx.repository, true).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = fx
        .service
        .create_manual_annotation(manual_request("u2", "good"))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(listed(&fx.repository, true).await, before);

    fx.service
        .create_manual_annotation(manual_request("u2", "bad"))
        .await
        .unwrap();
    let after = listed(&fx.repository, false).await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].value, AnnotationValue::String("bad".to_string()));
    assert_eq!(after[0].created_by, "u1");
    assert_eq!(after[0].created_at, before[0].created_at);
    assert_eq!(after[0].updated_by, "u2");
}

#[tokio::test]
async fn test_update_rejects_mismatched_id() {
    let fx = fixture();
    seed(&fx.repository, SPAN_START).await;

    let err = fx
        .service
        .update_manual_annotation("not-the-id", manual_request("bob", "meh"))
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::InvalidArgument));
    assert_eq!(fx.repository.annotation_count(TENANT), 0);
}

#[tokio::test]
async fn test_delete_writes_tombstone() {
    let fx = fixture();
    seed(&fx.repository, SPAN_START).await;
    let id = fx
        .service
        .create_manual_annotation(manual_request("alice", "great"))
        .await
        .unwrap();

    fx.service
        .delete_manual_annotation(
            &id,
            manual_target("bob"),
            AnnotationType::ManualFeedback,
            "score",
        )
        .await
        .unwrap();

    assert!(listed(&fx.repository, false).await.is_empty());
    let all = listed(&fx.repository, true).await;
    assert_eq!(all.len(), 1);
    assert!(all[0].is_deleted);
    assert_eq!(all[0].updated_by, "bob");
    assert_eq!(all[0].value, AnnotationValue::String("great".to_string()));
}

// ============================================================================
// AUTOMATED
// ============================================================================

#[tokio::test]
async fn test_create_annotation_writes_when_span_is_stored() {
    let fx = fixture();
    let start = chrono::Utc::now().timestamp_micros() - 1_000_000;
    seed(&fx.repository, start).await;

    fx.service
        .create_annotation(evaluator_request())
        .await
        .unwrap();

    let rows = listed(&fx.repository, false).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].annotation_type, AnnotationType::AutoEvaluator);
    assert_eq!(rows[0].start_time, start);
    assert_eq!(fx.factory.pending(TOPIC, "unsubscribed"), 0);
}

#[tokio::test]
async fn test_create_annotation_rejects_unknown_caller() {
    let fx = fixture();
    let req = AnnotationRequest {
        caller: "stranger".to_string(),
        ..evaluator_request()
    };
    let err = fx.service.create_annotation(req).await.unwrap_err();
    assert!(err.is(ErrorKind::InvalidArgument));
}

#[tokio::test(start_paused = true)]
async fn test_deferred_annotation_lands_after_span_arrives() {
    let fx = fixture();
    let registry = ConsumerRegistry::new(Arc::new(fx.factory.clone()));
    registry
        .register(Arc::new(AnnotationEventConsumer::new(
            fx.config.clone(),
            fx.repository.clone(),
            fx.producer.clone(),
        )))
        .await;
    registry.start_all().await.unwrap();

    fx.service
        .create_annotation(evaluator_request())
        .await
        .unwrap();
    assert_eq!(fx.repository.annotation_count(TENANT), 0);

    seed(&fx.repository, chrono::Utc::now().timestamp_micros() - 1_000_000).await;

    for _ in 0..300 {
        if fx.repository.annotation_count(TENANT) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(fx.repository.annotation_count(TENANT), 1);
    assert_eq!(listed(&fx.repository, false).await[0].key, "accuracy");

    fx.producer.close().await;
    registry.close_all().await;
}

#[tokio::test]
async fn test_delete_annotation_tombstones_stored_row() {
    let fx = fixture();
    let start = chrono::Utc::now().timestamp_micros() - 1_000_000;
    seed(&fx.repository, start).await;
    fx.service
        .create_annotation(evaluator_request())
        .await
        .unwrap();

    fx.service
        .delete_annotation(evaluator_request())
        .await
        .unwrap();

    assert!(listed(&fx.repository, false).await.is_empty());
    let all = listed(&fx.repository, true).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].value, AnnotationValue::String("good".to_string()));
}

// ============================================================================
// EVENT CONSUMER
// ============================================================================

fn pending_event(retry_times: u32) -> AnnotationEvent {
    let now = chrono::Utc::now().timestamp_micros();
    AnnotationEvent {
        annotation: Annotation::build(
            &SpanTarget {
                workspace_id: "7".to_string(),
                trace_id: "t1".to_string(),
                span_id: "s1".to_string(),
                start_time: 0,
            },
            AnnotationType::AutoEvaluator,
            "accuracy",
            AnnotationValue::Bool(true),
            "",
            "eval-bot",
        ),
        caller: "evaluator".to_string(),
        start_at: now - 60_000_000,
        end_at: now,
        retry_times,
    }
}

fn event_consumer(fx: &Fixture) -> AnnotationEventConsumer {
    AnnotationEventConsumer::new(fx.config.clone(), fx.repository.clone(), fx.producer.clone())
}

#[tokio::test(start_paused = true)]
async fn test_event_consumer_spends_one_retry() {
    let fx = fixture();
    let consumer = event_consumer(&fx);

    consumer
        .handle_message(&event_message(&pending_event(1)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(ANNOTATION_EVENT_DEFER_SECS + 1)).await;
    assert_eq!(fx.factory.pending(TOPIC, "unsubscribed"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_event_consumer_drops_exhausted_event() {
    let fx = fixture();
    let consumer = event_consumer(&fx);

    consumer
        .handle_message(&event_message(&pending_event(0)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(ANNOTATION_EVENT_DEFER_SECS + 1)).await;
    assert_eq!(fx.factory.pending(TOPIC, "unsubscribed"), 0);
    assert_eq!(fx.repository.annotation_count(TENANT), 0);
}

#[tokio::test]
async fn test_event_consumer_persists_found_span() {
    let fx = fixture();
    let start = chrono::Utc::now().timestamp_micros() - 1_000_000;
    seed(&fx.repository, start).await;

    event_consumer(&fx)
        .handle_message(&event_message(&pending_event(ANNOTATION_RETRY_TIMES)))
        .await
        .unwrap();

    let rows = listed(&fx.repository, false).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].start_time, start);
    assert_eq!(rows[0].value, AnnotationValue::Bool(true));
}

#[tokio::test]
async fn test_event_consumer_acks_garbage() {
    let fx = fixture();
    let msg = MessageExt {
        message: Message::new(TOPIC, b"not json".to_vec()),
        message_id: "m1".to_string(),
        reconsume_times: 0,
    };
    assert!(event_consumer(&fx).handle_message(&msg).await.is_ok());
}

#[test]
fn test_event_consumer_config() {
    let fx = fixture();
    let cfg = event_consumer(&fx).consumer_config().unwrap();
    assert_eq!(cfg.topic, TOPIC);
    assert_eq!(cfg.consumer_group, "acg");
}
