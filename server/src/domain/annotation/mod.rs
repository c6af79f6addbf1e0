//! Annotation service
//!
//! Manual annotations come from a signed-in user and target a span the user is
//! looking at, so the span must already be stored. Automated annotations come
//! from evaluators and may race ingestion: when the span is not found yet the
//! write is parked on the annotation topic and retried by
//! [`AnnotationEventConsumer`].

mod event;

#[cfg(test)]
mod annotation_tests;

pub use event::{AnnotationEvent, AnnotationEventConsumer, AnnotationProducer};

use std::sync::Arc;

use crate::core::constants::{ANNOTATION_RETRY_TIMES, MANUAL_ANNOTATION_WINDOW_MICROS};
use crate::core::trace_config::TraceConfig;
use crate::data::types::{
    Annotation, AnnotationType, AnnotationValue, COL_INPUT, COL_OUTPUT, PlatformType, Span,
    SpanTarget, annotation_id,
};
use crate::data::{GetTraceParam, TraceRepository};
use crate::domain::error::{ServiceError, ServiceResult};

const MICROS_PER_DAY: i64 = 86_400_000_000;

// ============================================================================
// REQUESTS
// ============================================================================

/// Where a manual annotation goes and who writes it
#[derive(Debug, Clone, Default)]
pub struct ManualAnnotationTarget {
    pub platform: PlatformType,
    pub workspace_id: String,
    pub trace_id: String,
    pub span_id: String,
    /// Claimed span start in microseconds
    pub start_time: i64,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct ManualAnnotationRequest {
    pub target: ManualAnnotationTarget,
    pub annotation_type: AnnotationType,
    pub key: String,
    pub value: AnnotationValue,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationRequest {
    /// Selects tenants and annotation type from `annotation_source_config`
    pub caller: String,
    pub workspace_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub key: String,
    pub value: AnnotationValue,
    pub reasoning: String,
    pub user_id: String,
    /// How far back to look for the span
    pub query_days: i64,
}

/// A span found in storage together with the tenant holding it
#[derive(Debug, Clone)]
pub(crate) struct LocatedSpan {
    pub tenant: String,
    pub span: Span,
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct AnnotationService {
    config: Arc<dyn TraceConfig>,
    repository: Arc<dyn TraceRepository>,
    producer: Arc<AnnotationProducer>,
}

impl AnnotationService {
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

    /// Create a manual annotation; returns its ID.
    ///
    /// Repeating a create with the same content writes nothing. The author and
    /// creation time of an existing row are never replaced.
    pub async fn create_manual_annotation(
        &self,
        req: ManualAnnotationRequest,
    ) -> ServiceResult<String> {
        let located = self.locate_manual(&req.target).await?;
        let mut annotation = Annotation::build(
            &span_target(&req.target.workspace_id, &located.span),
            req.annotation_type,
            &req.key,
            req.value,
            &req.reasoning,
            &req.target.user_id,
        );
        if let Some(previous) =
            previous_row(self.repository.as_ref(), &located.tenant, &annotation).await?
        {
            if !previous.is_deleted
                && previous.value == annotation.value
                && previous.reasoning == annotation.reasoning
            {
                tracing::debug!(id = %previous.id, "Manual annotation unchanged");
                return Ok(previous.id);
            }
            annotation.created_by = previous.created_by;
            annotation.created_at = previous.created_at;
        }
        self.repository
            .insert_annotations(&located.tenant, std::slice::from_ref(&annotation))
            .await?;
        tracing::debug!(id = %annotation.id, tenant = %located.tenant, "Manual annotation created");
        Ok(annotation.id)
    }

    /// Overwrite a manual annotation, keeping its original author and creation time
    pub async fn update_manual_annotation(
        &self,
        annotation_id: &str,
        req: ManualAnnotationRequest,
    ) -> ServiceResult<()> {
        let located = self.locate_manual(&req.target).await?;
        let target = span_target(&req.target.workspace_id, &located.span);
        check_id(annotation_id, &target, &req.key, req.annotation_type)?;

        let mut annotation = Annotation::build(
            &target,
            req.annotation_type,
            &req.key,
            req.value,
            &req.reasoning,
            &req.target.user_id,
        );
        let previous =
            previous_row(self.repository.as_ref(), &located.tenant, &annotation).await?;
        if let Some(previous) = previous {
            annotation.created_by = previous.created_by;
            annotation.created_at = previous.created_at;
        }
        self.repository
            .insert_annotations(&located.tenant, &[annotation])
            .await?;
        Ok(())
    }

    /// Tombstone a manual annotation
    pub async fn delete_manual_annotation(
        &self,
        annotation_id: &str,
        target: ManualAnnotationTarget,
        annotation_type: AnnotationType,
        key: &str,
    ) -> ServiceResult<()> {
        let located = self.locate_manual(&target).await?;
        let bound = span_target(&target.workspace_id, &located.span);
        check_id(annotation_id, &bound, key, annotation_type)?;

        let fresh = Annotation::build(
            &bound,
            annotation_type,
            key,
            AnnotationValue::default(),
            "",
            &target.user_id,
        );
        let mut tombstone = previous_row(self.repository.as_ref(), &located.tenant, &fresh)
            .await?
            .unwrap_or(fresh);
        tombstone.mark_deleted(&target.user_id);
        self.repository
            .insert_annotations(&located.tenant, &[tombstone])
            .await?;
        Ok(())
    }

    /// Annotate a span on behalf of `caller`, parking the write if the span is not stored yet
    pub async fn create_annotation(&self, req: AnnotationRequest) -> ServiceResult<()> {
        let source = self.config.annotation_source(&req.caller)?;
        let annotation = Annotation::build(
            &SpanTarget {
                workspace_id: req.workspace_id.clone(),
                trace_id: req.trace_id.clone(),
                span_id: req.span_id.clone(),
                start_time: 0,
            },
            source.annotation_type,
            &req.key,
            req.value.clone(),
            &req.reasoning,
            &req.user_id,
        );
        let (start_at, end_at) = query_window(req.query_days);
        self.write_or_defer(&req, &source.tenants, annotation, start_at, end_at)
            .await
    }

    /// Tombstone a caller's annotation, parking the write if the span is not stored yet
    pub async fn delete_annotation(&self, req: AnnotationRequest) -> ServiceResult<()> {
        let source = self.config.annotation_source(&req.caller)?;
        let mut annotation = Annotation::build(
            &SpanTarget {
                workspace_id: req.workspace_id.clone(),
                trace_id: req.trace_id.clone(),
                span_id: req.span_id.clone(),
                start_time: 0,
            },
            source.annotation_type,
            &req.key,
            AnnotationValue::default(),
            "",
            &req.user_id,
        );
        annotation.mark_deleted(&req.user_id);
        let (start_at, end_at) = query_window(req.query_days);
        self.write_or_defer(&req, &source.tenants, annotation, start_at, end_at)
            .await
    }

    async fn write_or_defer(
        &self,
        req: &AnnotationRequest,
        tenants: &[String],
        annotation: Annotation,
        start_at: i64,
        end_at: i64,
    ) -> ServiceResult<()> {
        let located = locate_span(
            self.repository.as_ref(),
            tenants,
            &req.trace_id,
            &req.span_id,
            start_at,
            end_at,
        )
        .await?;
        match located {
            Some(located) => persist_located(self.repository.as_ref(), &located, annotation).await,
            None => {
                tracing::info!(
                    caller = %req.caller,
                    trace_id = %req.trace_id,
                    span_id = %req.span_id,
                    "Span not stored yet, deferring annotation"
                );
                self.producer
                    .publish(&AnnotationEvent {
                        annotation,
                        caller: req.caller.clone(),
                        start_at,
                        end_at,
                        retry_times: ANNOTATION_RETRY_TIMES,
                    })
                    .await
            }
        }
    }

    async fn locate_manual(&self, target: &ManualAnnotationTarget) -> ServiceResult<LocatedSpan> {
        let tenants = self.config.platform_tenants(target.platform)?;
        locate_span(
            self.repository.as_ref(),
            &tenants,
            &target.trace_id,
            &target.span_id,
            target.start_time - MANUAL_ANNOTATION_WINDOW_MICROS,
            target.start_time + MANUAL_ANNOTATION_WINDOW_MICROS,
        )
        .await?
        .filter(|l| target.workspace_id.is_empty() || l.span.workspace_id == target.workspace_id)
        .ok_or_else(|| {
            ServiceError::invalid_argument(format!(
                "span {} of trace {} not found",
                target.span_id, target.trace_id
            ))
        })
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn span_target(workspace_id: &str, span: &Span) -> SpanTarget {
    SpanTarget {
        workspace_id: if workspace_id.is_empty() {
            span.workspace_id.clone()
        } else {
            workspace_id.to_string()
        },
        trace_id: span.trace_id.clone(),
        span_id: span.span_id.clone(),
        start_time: span.start_time,
    }
}

fn check_id(
    claimed: &str,
    target: &SpanTarget,
    key: &str,
    annotation_type: AnnotationType,
) -> ServiceResult<()> {
    let expected = annotation_id(target, key, annotation_type);
    if claimed != expected {
        return Err(ServiceError::invalid_argument(format!(
            "annotation id {claimed} does not match its target"
        )));
    }
    Ok(())
}

/// `[now - days, now]` in microseconds
fn query_window(days: i64) -> (i64, i64) {
    let now = chrono::Utc::now().timestamp_micros();
    (now - days.max(0).saturating_mul(MICROS_PER_DAY), now)
}

/// Find one span, tenant by tenant, so the caller knows where to write
pub(crate) async fn locate_span(
    repository: &dyn TraceRepository,
    tenants: &[String],
    trace_id: &str,
    span_id: &str,
    start_time: i64,
    end_time: i64,
) -> ServiceResult<Option<LocatedSpan>> {
    for tenant in tenants {
        let spans = repository
            .get_trace(&GetTraceParam {
                tenants: vec![tenant.clone()],
                trace_id: trace_id.to_string(),
                span_ids: vec![span_id.to_string()],
                start_time,
                end_time,
                limit: 1,
                omit_columns: vec![COL_INPUT.to_string(), COL_OUTPUT.to_string()],
                ..Default::default()
            })
            .await?;
        if let Some(span) = spans.into_iter().next() {
            return Ok(Some(LocatedSpan {
                tenant: tenant.clone(),
                span,
            }));
        }
    }
    Ok(None)
}

async fn previous_row(
    repository: &dyn TraceRepository,
    tenant: &str,
    annotation: &Annotation,
) -> ServiceResult<Option<Annotation>> {
    Ok(repository
        .get_annotation(
            &[tenant.to_string()],
            &annotation.id,
            annotation.start_time,
            annotation.start_time,
        )
        .await?)
}

/// Bind `annotation` to the located span and store it.
///
/// A tombstone keeps the value of the row it replaces.
pub(crate) async fn persist_located(
    repository: &dyn TraceRepository,
    located: &LocatedSpan,
    mut annotation: Annotation,
) -> ServiceResult<()> {
    annotation.rebind(located.span.start_time);
    if annotation.is_deleted
        && let Some(mut previous) = previous_row(repository, &located.tenant, &annotation).await?
    {
        previous.mark_deleted(&annotation.updated_by);
        annotation = previous;
    }
    repository
        .insert_annotations(&located.tenant, std::slice::from_ref(&annotation))
        .await?;
    tracing::debug!(id = %annotation.id, tenant = %located.tenant, "Annotation stored");
    Ok(())
}
