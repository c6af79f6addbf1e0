//! Ingestion service
//!
//! Runs a tenant's ingest stages over a normalized batch, splits it to fit the
//! broker's message size limit and hands the pieces to the tenant's producer.
//! Sends are asynchronous: once a payload is queued the caller is released and
//! broker failures only reach the log.

mod worker;

#[cfg(test)]
mod ingest_tests;

pub use worker::SpanConsumer;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::constants::MAX_BATCH_SIZE_BYTES;
use crate::core::trace_config::{TenantConfig, TraceConfig};
use crate::data::broker::{BrokerError, BrokerFactory, Message, Producer, SendResult};
use crate::data::types::{SYSTEM_TAG_RUNTIME, Span, TenantInfo, TraceData, TtlClass};
use crate::domain::error::{ServiceError, ServiceResult};
use crate::domain::normalize::{TraceRequest, normalize_request, pb};
use crate::domain::processor::{ProcessContext, ProcessorBuilder, run_stages, scrub_system_tags};

/// A batch of already-normalized spans for one tenant
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub tenant: String,
    /// Overrides the tenant's configured retention class
    pub ttl: Option<TtlClass>,
    pub which_is_enough: i32,
    pub coze_account_id: String,
    pub spans: Vec<Span>,
}

/// An OTLP request as received from an SDK or collector
#[derive(Debug, Clone, Default)]
pub struct OtelIngestRequest {
    /// Empty selects `trace_default_tenant`
    pub tenant: String,
    /// Filled into spans that carry no workspace of their own
    pub workspace_id: String,
    pub ttl: Option<TtlClass>,
    pub request: TraceRequest,
}

pub struct IngestService {
    config: Arc<dyn TraceConfig>,
    factory: Arc<dyn BrokerFactory>,
    processors: ProcessorBuilder,
    /// tenant -> started producer
    producers: Mutex<HashMap<String, Arc<dyn Producer>>>,
    max_batch_bytes: usize,
}

impl IngestService {
    pub fn new(
        config: Arc<dyn TraceConfig>,
        factory: Arc<dyn BrokerFactory>,
        processors: ProcessorBuilder,
    ) -> Self {
        Self {
            config,
            factory,
            processors,
            producers: Mutex::new(HashMap::new()),
            max_batch_bytes: MAX_BATCH_SIZE_BYTES,
        }
    }

    /// Override the per-message size limit
    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes.max(1);
        self
    }

    /// Ingest client-built spans; their system tags are discarded
    pub async fn ingest(&self, req: IngestRequest) -> ServiceResult<()> {
        self.ingest_scrubbed(req, &[]).await
    }

    /// Keep only the `keep` system tags, then run the tenant's stages and send
    async fn ingest_scrubbed(&self, mut req: IngestRequest, keep: &[&str]) -> ServiceResult<()> {
        let tenant_cfg = self.config.tenant_config(&req.tenant)?;
        let stages = self.processors.ingest_stages(&req.tenant)?;
        scrub_system_tags(&mut req.spans, &req.tenant, keep);
        let ctx = ProcessContext {
            tenant: req.tenant.clone(),
            workspace_id: None,
        };
        let spans = run_stages(&stages, &ctx, req.spans).await?;
        if spans.is_empty() {
            tracing::debug!(tenant = %req.tenant, "Nothing left to ingest after processing");
            return Ok(());
        }

        let data = TraceData {
            tenant: req.tenant.clone(),
            tenant_info: TenantInfo {
                ttl: req.ttl.unwrap_or(tenant_cfg.ttl),
                which_is_enough: req.which_is_enough,
                coze_account_id: req.coze_account_id,
            },
            spans,
        };
        let mut payloads = Vec::new();
        split_payloads(data, self.max_batch_bytes, &mut payloads)?;

        let producer = self.producer(&tenant_cfg).await?;
        for (body, span_count) in payloads {
            let tenant = req.tenant.clone();
            producer.send_async(
                Message::new("", body),
                Box::new(move |result: Result<SendResult, BrokerError>| match result {
                    Ok(sent) => tracing::debug!(
                        tenant = %tenant,
                        message_id = %sent.message_id,
                        span_count,
                        "Span batch sent"
                    ),
                    Err(e) => tracing::error!(
                        tenant = %tenant,
                        span_count,
                        error = %e,
                        "Failed to send span batch"
                    ),
                }),
            )?;
        }
        Ok(())
    }

    /// Normalize an OTLP JSON request and ingest the result
    pub async fn ingest_otel(&self, req: OtelIngestRequest) -> ServiceResult<usize> {
        let tenant = if req.tenant.is_empty() {
            self.config.default_tenant()?
        } else {
            req.tenant
        };
        let mut spans = normalize_request(&req.request);
        let dropped = req.request.span_count() - spans.len();
        if dropped > 0 {
            tracing::warn!(tenant = %tenant, dropped, "Dropped spans during normalization");
        }
        for span in &mut spans {
            if span.workspace_id.is_empty() {
                span.workspace_id.clone_from(&req.workspace_id);
            }
        }

        let accepted = spans.len();
        // Runtime is derived by the normalizer, never copied from attributes
        self.ingest_scrubbed(
            IngestRequest {
                tenant,
                ttl: req.ttl,
                spans,
                ..Default::default()
            },
            &[SYSTEM_TAG_RUNTIME],
        )
        .await?;
        Ok(accepted)
    }

    /// Decode an OTLP protobuf body and ingest it like [`Self::ingest_otel`]
    pub async fn ingest_otel_proto(
        &self,
        tenant: String,
        workspace_id: String,
        ttl: Option<TtlClass>,
        body: &[u8],
    ) -> ServiceResult<usize> {
        let request = pb::decode(body)
            .map_err(|e| ServiceError::invalid_argument(format!("invalid OTLP protobuf: {e}")))?;
        self.ingest_otel(OtelIngestRequest {
            tenant,
            workspace_id,
            ttl,
            request,
        })
        .await
    }

    /// Close every producer opened so far
    pub async fn close(&self) {
        let producers = std::mem::take(&mut *self.producers.lock().await);
        for (tenant, producer) in producers {
            if let Err(e) = producer.close().await {
                tracing::warn!(tenant = %tenant, error = %e, "Failed to close producer");
            }
        }
    }

    async fn producer(&self, tenant_cfg: &TenantConfig) -> ServiceResult<Arc<dyn Producer>> {
        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(&tenant_cfg.tenant) {
            return Ok(Arc::clone(producer));
        }

        let base = self.config.trace_producer_config()?;
        let producer_cfg = tenant_cfg.producer_config(&base);
        let topic = producer_cfg.topic.clone();
        let producer = self.factory.create_producer(producer_cfg).await?;
        producer.start().await?;
        tracing::info!(tenant = %tenant_cfg.tenant, topic = %topic, "Ingest producer started");

        producers.insert(tenant_cfg.tenant.clone(), Arc::clone(&producer));
        Ok(producer)
    }
}

/// Serialize `data`, splitting it per span while it exceeds `max_bytes`.
///
/// Appends `(body, span_count)` pairs. A single span over the limit fails the
/// whole batch before anything is sent.
fn split_payloads(
    data: TraceData,
    max_bytes: usize,
    out: &mut Vec<(Vec<u8>, usize)>,
) -> ServiceResult<()> {
    let body = serde_json::to_vec(&data)?;
    if body.len() <= max_bytes {
        out.push((body, data.spans.len()));
        return Ok(());
    }
    if data.spans.len() <= 1 {
        return Err(ServiceError::invalid_argument(format!(
            "span payload of {} bytes exceeds the {max_bytes} byte limit",
            body.len()
        )));
    }

    tracing::debug!(
        tenant = %data.tenant,
        bytes = body.len(),
        spans = data.spans.len(),
        "Splitting oversized span batch"
    );
    let TraceData {
        tenant,
        tenant_info,
        spans,
    } = data;
    for span in spans {
        split_payloads(
            TraceData {
                tenant: tenant.clone(),
                tenant_info: tenant_info.clone(),
                spans: vec![span],
            },
            max_bytes,
            out,
        )?;
    }
    Ok(())
}
