//! Deferred annotation writes
//!
//! An annotation whose span is not stored yet travels through the annotation
//! topic with a delivery delay. Each pass that still misses the span spends
//! one retry and publishes the event again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{locate_span, persist_located};
use crate::core::constants::ANNOTATION_EVENT_DEFER_SECS;
use crate::core::trace_config::TraceConfig;
use crate::data::TraceRepository;
use crate::data::broker::{BrokerFactory, ConsumerConfig, ConsumerHandler, Message, MessageExt, Producer};
use crate::data::types::Annotation;
use crate::domain::consumer::ConsumerConfigProvider;
use crate::domain::error::{ServiceError, ServiceResult};

/// An annotation waiting for its span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEvent {
    pub annotation: Annotation,
    pub caller: String,
    /// Search window for the span, microseconds
    pub start_at: i64,
    pub end_at: i64,
    /// Publishes left before the event is dropped
    pub retry_times: u32,
}

// ============================================================================
// PRODUCER
// ============================================================================

/// Publishes annotation events over one lazily created producer
pub struct AnnotationProducer {
    config: Arc<dyn TraceConfig>,
    factory: Arc<dyn BrokerFactory>,
    producer: OnceCell<Arc<dyn Producer>>,
    defer: Duration,
}

impl AnnotationProducer {
    pub fn new(config: Arc<dyn TraceConfig>, factory: Arc<dyn BrokerFactory>) -> Self {
        Self {
            config,
            factory,
            producer: OnceCell::new(),
            defer: Duration::from_secs(ANNOTATION_EVENT_DEFER_SECS),
        }
    }

    async fn producer(&self) -> ServiceResult<&Arc<dyn Producer>> {
        self.producer
            .get_or_try_init(|| async {
                let producer_cfg = self.config.annotation_producer_config()?;
                let topic = producer_cfg.topic.clone();
                let producer = self.factory.create_producer(producer_cfg).await?;
                producer.start().await?;
                tracing::info!(topic = %topic, "Annotation producer started");
                Ok::<_, ServiceError>(producer)
            })
            .await
    }

    pub async fn publish(&self, event: &AnnotationEvent) -> ServiceResult<()> {
        let body = serde_json::to_vec(event)?;
        let msg = Message::new("", body)
            .with_partition_key(event.annotation.trace_id.clone())
            .with_defer(self.defer);
        let sent = self.producer().await?.send(msg).await?;
        tracing::debug!(
            message_id = %sent.message_id,
            annotation_id = %event.annotation.id,
            retry_times = event.retry_times,
            "Annotation event published"
        );
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(producer) = self.producer.get()
            && let Err(e) = producer.close().await
        {
            tracing::warn!(error = %e, "Failed to close annotation producer");
        }
    }
}

// ============================================================================
// CONSUMER
// ============================================================================

pub struct AnnotationEventConsumer {
    config: Arc<dyn TraceConfig>,
    repository: Arc<dyn TraceRepository>,
    producer: Arc<AnnotationProducer>,
}

impl AnnotationEventConsumer {
    pub fn new(
        config: Arc<dyn TraceConfig>,
        repository: Arc<dyn TraceRepository>,
        producer: Arc<AnnotationProducer>,
    ) -> Self {
        Self {
            config,
            repository,
            producer,
        }
    }
}

impl ConsumerConfigProvider for AnnotationEventConsumer {
    fn consumer_config(&self) -> ServiceResult<ConsumerConfig> {
        self.config.annotation_consumer_config()
    }
}

#[async_trait]
impl ConsumerHandler for AnnotationEventConsumer {
    async fn handle_message(&self, msg: &MessageExt) -> anyhow::Result<()> {
        let mut event: AnnotationEvent = match serde_json::from_slice(&msg.message.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(message_id = %msg.message_id, error = %e, "Dropping undecodable annotation event");
                return Ok(());
            }
        };
        let source = match self.config.annotation_source(&event.caller) {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(caller = %event.caller, error = %e, "Dropping annotation event of unknown caller");
                return Ok(());
            }
        };

        let located = locate_span(
            self.repository.as_ref(),
            &source.tenants,
            &event.annotation.trace_id,
            &event.annotation.span_id,
            event.start_at,
            event.end_at,
        )
        .await?;
        if let Some(located) = located {
            persist_located(self.repository.as_ref(), &located, event.annotation).await?;
            return Ok(());
        }

        if event.retry_times == 0 {
            tracing::warn!(
                annotation_id = %event.annotation.id,
                trace_id = %event.annotation.trace_id,
                span_id = %event.annotation.span_id,
                "Span never arrived, dropping annotation"
            );
            return Ok(());
        }
        event.retry_times -= 1;
        if let Err(e) = self.producer.publish(&event).await {
            tracing::error!(
                annotation_id = %event.annotation.id,
                error = %e,
                "Failed to republish annotation event"
            );
        }
        Ok(())
    }
}
