//! Span processor stages
//!
//! Stages are named in `trace_platform_span_handler_config` and resolved per
//! tenant (ingest and consume side) or per platform (query side). A stage may
//! mutate or drop spans; an error aborts the whole call.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::constants::DEFAULT_OFFLOAD_PREVIEW_BYTES;
use crate::core::trace_config::{AttrTosConfig, TraceConfig};
use crate::data::object_store::{ObjectStore, span_attr_key};
use crate::data::types::{
    COL_INPUT, COL_OUTPUT, SYSTEM_TAG_ALLOWLIST, SYSTEM_TAG_INPUT_TOS_KEY,
    SYSTEM_TAG_OUTPUT_TOS_KEY, SYSTEM_TAG_TENANT, Span,
};
use crate::domain::error::{ServiceError, ServiceResult};

pub const PROCESSOR_DROP_INVALID: &str = "drop_invalid";
pub const PROCESSOR_SYSTEM_TAGS: &str = "system_tags";
pub const PROCESSOR_ATTR_OFFLOAD: &str = "attr_offload";
pub const PROCESSOR_WORKSPACE_CHECK: &str = "workspace_check";
pub const PROCESSOR_ATTR_RESOLVE: &str = "attr_resolve";

/// What a stage knows about the call it runs in
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    pub tenant: String,
    /// Workspace the caller is scoped to, when known
    pub workspace_id: Option<String>,
}

#[async_trait]
pub trait SpanProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &ProcessContext, spans: Vec<Span>) -> ServiceResult<Vec<Span>>;
}

/// Run stages in order
pub async fn run_stages(
    stages: &[Arc<dyn SpanProcessor>],
    ctx: &ProcessContext,
    mut spans: Vec<Span>,
) -> ServiceResult<Vec<Span>> {
    for stage in stages {
        spans = stage.process(ctx, spans).await.map_err(|e| {
            tracing::warn!(stage = stage.name(), error = %e, "Span processor failed");
            e
        })?;
    }
    Ok(spans)
}

// ============================================================================
// STAGES
// ============================================================================

/// Drops spans without trace or span id
pub struct DropInvalidProcessor;

#[async_trait]
impl SpanProcessor for DropInvalidProcessor {
    fn name(&self) -> &'static str {
        PROCESSOR_DROP_INVALID
    }

    async fn process(&self, _ctx: &ProcessContext, mut spans: Vec<Span>) -> ServiceResult<Vec<Span>> {
        let before = spans.len();
        spans.retain(|s| !s.trace_id.is_empty() && !s.span_id.is_empty());
        if spans.len() < before {
            tracing::debug!(dropped = before - spans.len(), "Dropped spans without ids");
        }
        Ok(spans)
    }
}

/// Clear `system_tags_string` except the `keep` keys, then stamp the tenant.
///
/// Runs on every batch entering ingest, whatever stages are configured; the
/// bag only ever holds keys the server wrote after this point.
pub fn scrub_system_tags(spans: &mut [Span], tenant: &str, keep: &[&str]) {
    for span in spans {
        span.system_tags_string.retain(|k, _| {
            let kept = keep.contains(&k.as_str());
            if !kept {
                tracing::debug!(key = %k, span_id = %span.span_id, "Removing client system tag");
            }
            kept
        });
        span.system_tags_string
            .insert(SYSTEM_TAG_TENANT.to_string(), tenant.to_string());
    }
}

/// Drops system tags the server never writes and stamps the tenant
pub struct SystemTagsProcessor;

#[async_trait]
impl SpanProcessor for SystemTagsProcessor {
    fn name(&self) -> &'static str {
        PROCESSOR_SYSTEM_TAGS
    }

    async fn process(&self, ctx: &ProcessContext, mut spans: Vec<Span>) -> ServiceResult<Vec<Span>> {
        for span in &mut spans {
            span.system_tags_string.retain(|k, _| {
                let allowed = SYSTEM_TAG_ALLOWLIST.contains(&k.as_str());
                if !allowed {
                    tracing::debug!(key = %k, span_id = %span.span_id, "Removing unknown system tag");
                }
                allowed
            });
            span.system_tags_string
                .insert(SYSTEM_TAG_TENANT.to_string(), ctx.tenant.clone());
        }
        Ok(spans)
    }
}

/// Promotes large input/output bodies into the object store
pub struct AttrOffloadProcessor {
    store: Arc<dyn ObjectStore>,
    config: AttrTosConfig,
}

impl AttrOffloadProcessor {
    pub fn new(store: Arc<dyn ObjectStore>, config: AttrTosConfig) -> Self {
        Self { store, config }
    }

    async fn offload(
        &self,
        ctx: &ProcessContext,
        span: &mut Span,
        attr: &'static str,
        threshold: Option<usize>,
    ) -> ServiceResult<()> {
        let (body, tag) = match attr {
            COL_INPUT => (&mut span.input, SYSTEM_TAG_INPUT_TOS_KEY),
            _ => (&mut span.output, SYSTEM_TAG_OUTPUT_TOS_KEY),
        };
        let Some(threshold) = threshold else {
            return Ok(());
        };
        if body.len() <= threshold {
            return Ok(());
        }
        let key = span_attr_key(&ctx.tenant, &span.trace_id, &span.span_id, attr);
        // Already offloaded by this stage; the body is the preview
        if span.system_tags_string.get(tag) == Some(&key) {
            return Ok(());
        }

        let full = std::mem::take(body);
        let preview_len = self.config.preview_bytes.unwrap_or(DEFAULT_OFFLOAD_PREVIEW_BYTES);
        *body = truncate_at_char_boundary(&full, preview_len).to_string();
        self.store
            .put(&key, full.into_bytes())
            .await
            .map_err(|e| ServiceError::rpc(format!("offload {attr}: {e}")))?;
        span.system_tags_string.insert(tag.to_string(), key);
        Ok(())
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[async_trait]
impl SpanProcessor for AttrOffloadProcessor {
    fn name(&self) -> &'static str {
        PROCESSOR_ATTR_OFFLOAD
    }

    async fn process(&self, ctx: &ProcessContext, mut spans: Vec<Span>) -> ServiceResult<Vec<Span>> {
        for span in &mut spans {
            self.offload(ctx, span, COL_INPUT, self.config.input_threshold_bytes)
                .await?;
            self.offload(ctx, span, COL_OUTPUT, self.config.output_threshold_bytes)
                .await?;
        }
        Ok(spans)
    }
}

/// Drops spans that belong to another workspace than the caller's
pub struct WorkspaceCheckProcessor;

#[async_trait]
impl SpanProcessor for WorkspaceCheckProcessor {
    fn name(&self) -> &'static str {
        PROCESSOR_WORKSPACE_CHECK
    }

    async fn process(&self, ctx: &ProcessContext, mut spans: Vec<Span>) -> ServiceResult<Vec<Span>> {
        if let Some(workspace_id) = ctx.workspace_id.as_deref() {
            spans.retain(|s| s.workspace_id == workspace_id);
        }
        Ok(spans)
    }
}

/// Loads offloaded bodies back from the object store.
///
/// Only keys derived from the span's own tenant and ids are read. A failed
/// load only affects that span, which is returned as stored.
pub struct AttrResolveProcessor {
    store: Arc<dyn ObjectStore>,
}

impl AttrResolveProcessor {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SpanProcessor for AttrResolveProcessor {
    fn name(&self) -> &'static str {
        PROCESSOR_ATTR_RESOLVE
    }

    async fn process(&self, ctx: &ProcessContext, mut spans: Vec<Span>) -> ServiceResult<Vec<Span>> {
        for span in &mut spans {
            let tenant = span
                .system_tags_string
                .get(SYSTEM_TAG_TENANT)
                .cloned()
                .unwrap_or_else(|| ctx.tenant.clone());
            for (tag, attr) in [
                (SYSTEM_TAG_INPUT_TOS_KEY, COL_INPUT),
                (SYSTEM_TAG_OUTPUT_TOS_KEY, COL_OUTPUT),
            ] {
                let Some(key) = span.system_tags_string.get(tag).cloned() else {
                    continue;
                };
                if key != span_attr_key(&tenant, &span.trace_id, &span.span_id, attr) {
                    tracing::warn!(
                        key = %key,
                        span_id = %span.span_id,
                        "Ignoring offload key not owned by span"
                    );
                    continue;
                }
                match self.store.get(&key).await {
                    Ok(bytes) => {
                        let body = String::from_utf8_lossy(&bytes).into_owned();
                        if attr == COL_INPUT {
                            span.input = body;
                        } else {
                            span.output = body;
                        }
                    }
                    Err(e) => tracing::warn!(
                        error = %e,
                        key = %key,
                        span_id = %span.span_id,
                        "Failed to resolve offloaded attribute, keeping preview"
                    ),
                }
            }
        }
        Ok(spans)
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Resolves stage names from config into processors
#[derive(Clone)]
pub struct ProcessorBuilder {
    config: Arc<dyn TraceConfig>,
    store: Arc<dyn ObjectStore>,
}

impl ProcessorBuilder {
    pub fn new(config: Arc<dyn TraceConfig>, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    pub fn build(&self, names: &[String]) -> ServiceResult<Vec<Arc<dyn SpanProcessor>>> {
        names
            .iter()
            .map(|name| -> ServiceResult<Arc<dyn SpanProcessor>> {
                Ok(match name.as_str() {
                    PROCESSOR_DROP_INVALID => Arc::new(DropInvalidProcessor),
                    PROCESSOR_SYSTEM_TAGS => Arc::new(SystemTagsProcessor),
                    PROCESSOR_ATTR_OFFLOAD => Arc::new(AttrOffloadProcessor::new(
                        Arc::clone(&self.store),
                        self.config.attr_tos_config(),
                    )),
                    PROCESSOR_WORKSPACE_CHECK => Arc::new(WorkspaceCheckProcessor),
                    PROCESSOR_ATTR_RESOLVE => {
                        Arc::new(AttrResolveProcessor::new(Arc::clone(&self.store)))
                    }
                    other => {
                        return Err(ServiceError::invalid_argument(format!(
                            "unknown span processor: {other}"
                        )));
                    }
                })
            })
            .collect()
    }

    /// Stages run before a tenant's batch is sent
    pub fn ingest_stages(&self, tenant: &str) -> ServiceResult<Vec<Arc<dyn SpanProcessor>>> {
        let cfg = self.config.span_handler_config()?;
        self.build(cfg.ingest_processors.get(tenant).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Stages run before a tenant's batch is stored
    pub fn consume_stages(&self, tenant: &str) -> ServiceResult<Vec<Arc<dyn SpanProcessor>>> {
        let cfg = self.config.span_handler_config()?;
        self.build(cfg.consume_processors.get(tenant).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Post-processors of a platform's queries
    pub fn query_stages(&self, platform: &str) -> ServiceResult<Vec<Arc<dyn SpanProcessor>>> {
        let cfg = self.config.span_handler_config()?;
        self.build(cfg.platform_processors.get(platform).map(Vec::as_slice).unwrap_or(&[]))
    }
}
