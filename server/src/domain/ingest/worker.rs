//! Ingest topic worker: decodes span batches and stores them

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::trace_config::TraceConfig;
use crate::data::TraceRepository;
use crate::data::broker::{ConsumerConfig, ConsumerHandler, MessageExt};
use crate::data::types::TraceData;
use crate::domain::consumer::ConsumerConfigProvider;
use crate::domain::error::ServiceResult;
use crate::domain::processor::{ProcessContext, ProcessorBuilder, run_stages};

pub struct SpanConsumer {
    tenant: String,
    config: Arc<dyn TraceConfig>,
    repository: Arc<dyn TraceRepository>,
    processors: ProcessorBuilder,
}

impl SpanConsumer {
    pub fn new(
        tenant: impl Into<String>,
        config: Arc<dyn TraceConfig>,
        repository: Arc<dyn TraceRepository>,
        processors: ProcessorBuilder,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            config,
            repository,
            processors,
        }
    }
}

impl ConsumerConfigProvider for SpanConsumer {
    fn consumer_config(&self) -> ServiceResult<ConsumerConfig> {
        let tenant_cfg = self.config.tenant_config(&self.tenant)?;
        let base = self.config.trace_producer_config()?;
        Ok(tenant_cfg.consumer_config(&base))
    }
}

#[async_trait]
impl ConsumerHandler for SpanConsumer {
    async fn handle_message(&self, msg: &MessageExt) -> anyhow::Result<()> {
        let data: TraceData = match serde_json::from_slice(&msg.message.body) {
            Ok(data) => data,
            Err(e) => {
                // Redelivery cannot fix a payload that does not decode
                tracing::error!(
                    tenant = %self.tenant,
                    message_id = %msg.message_id,
                    error = %e,
                    "Dropping undecodable span batch"
                );
                return Ok(());
            }
        };

        let stages = self.processors.consume_stages(&data.tenant)?;
        let ctx = ProcessContext {
            tenant: data.tenant.clone(),
            workspace_id: None,
        };
        let spans = run_stages(&stages, &ctx, data.spans).await?;
        self.repository
            .insert_spans(&data.tenant, data.tenant_info.ttl, &spans)
            .await?;

        tracing::debug!(
            tenant = %data.tenant,
            count = spans.len(),
            reconsume_times = msg.reconsume_times,
            "Span batch stored"
        );
        Ok(())
    }
}
