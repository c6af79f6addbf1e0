//! Query service
//!
//! Internal operations resolve their tenants from the platform's entry in
//! `trace_platform_tenants`; the OpenAPI variants take an explicit tenant list.
//! Request windows are in milliseconds, storage windows in microseconds.

mod advance;
mod filter;


pub use advance::{TraceAdvanceInfo, TraceQueryParam};
pub use filter::{BuiltinFilter, builtin_filter, rewrite_filters, workspace_filter};

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::constants::{
    ADVANCE_INFO_CONCURRENCY, GET_TRACE_LIMIT, LIST_ANNOTATIONS_WINDOW_MICROS,
    MAX_LIST_SPANS_LIMIT,
};
use crate::core::trace_config::{SystemView, TraceConfig};
use crate::data::traits::sort_spans;
use crate::data::types::{
    Annotation, FieldMeta, FilterFields, PlatformType, Span, SpanListType,
};
use crate::data::{
    GetTraceParam, ListAnnotationsParam, ListSpansParam, SortOrder, TraceRepository,
};
use crate::domain::error::{ServiceError, ServiceResult};
use crate::domain::processor::{ProcessContext, ProcessorBuilder, run_stages};

const MILLIS_PER_DAY: i64 = 86_400_000;

// ============================================================================
// REQUESTS
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ListSpansRequest {
    pub workspace_id: String,
    pub platform: PlatformType,
    pub span_list_type: SpanListType,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub filters: Option<FilterFields>,
    pub limit: usize,
    pub order: SortOrder,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListSpansOApiRequest {
    pub tenants: Vec<String>,
    pub workspace_id: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub filters: Option<FilterFields>,
    pub limit: usize,
    pub order: SortOrder,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListSpansResponse {
    pub spans: Vec<Span>,
    pub next_page_token: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetTraceRequest {
    pub workspace_id: String,
    pub platform: PlatformType,
    pub trace_id: String,
    /// Restrict to these spans when non-empty
    pub span_ids: Vec<String>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchTraceOApiRequest {
    pub tenants: Vec<String>,
    pub workspace_id: String,
    /// Searched by `log_id` when empty
    pub trace_id: String,
    pub log_id: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TracesAdvanceInfoRequest {
    pub workspace_id: String,
    pub platform: PlatformType,
    pub traces: Vec<TraceQueryParam>,
}

#[derive(Debug, Clone, Default)]
pub struct ListAnnotationsRequest {
    pub workspace_id: String,
    pub platform: PlatformType,
    pub trace_id: String,
    pub span_id: String,
    /// Start time of the span in microseconds
    pub start_time: i64,
    pub desc_by_updated_at: bool,
    pub include_deleted: bool,
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct QueryService {
    config: Arc<dyn TraceConfig>,
    repository: Arc<dyn TraceRepository>,
    processors: ProcessorBuilder,
    advance_info_concurrency: usize,
}

impl QueryService {
    pub fn new(
        config: Arc<dyn TraceConfig>,
        repository: Arc<dyn TraceRepository>,
        processors: ProcessorBuilder,
    ) -> Self {
        Self {
            config,
            repository,
            processors,
            advance_info_concurrency: ADVANCE_INFO_CONCURRENCY,
        }
    }

    /// Bound the number of concurrent lookups of `get_traces_advance_info`
    pub fn with_advance_info_concurrency(mut self, concurrency: usize) -> Self {
        self.advance_info_concurrency = concurrency.max(1);
        self
    }

    pub async fn list_spans(&self, req: ListSpansRequest) -> ServiceResult<ListSpansResponse> {
        check_window(req.start_time_ms, req.end_time_ms)?;
        let max_days = self.config.max_duration_day(req.platform);
        if req.end_time_ms - req.start_time_ms > max_days.saturating_mul(MILLIS_PER_DAY) {
            return Err(ServiceError::invalid_argument(format!(
                "query window exceeds {max_days} days for platform {}",
                req.platform
            )));
        }

        let builtin = builtin_filter(req.platform, req.span_list_type, &req.workspace_id);
        if builtin.short_circuits() {
            tracing::debug!(platform = %req.platform, "No builtin scope, returning no spans");
            return Ok(ListSpansResponse::default());
        }
        let user = rewritten(req.filters)?;
        let filters =
            FilterFields::combine_and([builtin.basic, builtin.platform, builtin.list, user]);

        let tenants = self.config.platform_tenants(req.platform)?;
        let result = self
            .repository
            .list_spans(&ListSpansParam {
                tenants: tenants.clone(),
                start_time: req.start_time_ms.saturating_mul(1_000),
                end_time: req.end_time_ms.saturating_mul(1_000),
                filters,
                limit: clamp_limit(req.limit),
                order: req.order,
                page_token: req.page_token,
                omit_columns: Vec::new(),
            })
            .await?;

        let spans = self
            .post_process(req.platform, &tenants, &req.workspace_id, result.spans)
            .await?;
        Ok(ListSpansResponse {
            spans,
            next_page_token: result.next_page_token,
            has_more: result.has_more,
        })
    }

    pub async fn list_spans_oapi(
        &self,
        req: ListSpansOApiRequest,
    ) -> ServiceResult<ListSpansResponse> {
        check_tenants(&req.tenants)?;
        check_window(req.start_time_ms, req.end_time_ms)?;
        let user = rewritten(req.filters)?;
        let filters = FilterFields::combine_and([workspace_filter(&req.workspace_id), user]);

        let result = self
            .repository
            .list_spans(&ListSpansParam {
                tenants: req.tenants,
                start_time: req.start_time_ms.saturating_mul(1_000),
                end_time: req.end_time_ms.saturating_mul(1_000),
                filters,
                limit: clamp_limit(req.limit),
                order: req.order,
                page_token: req.page_token,
                omit_columns: Vec::new(),
            })
            .await?;
        Ok(ListSpansResponse {
            spans: result.spans,
            next_page_token: result.next_page_token,
            has_more: result.has_more,
        })
    }

    /// Spans of one trace ordered by start time
    pub async fn get_trace(&self, req: GetTraceRequest) -> ServiceResult<Vec<Span>> {
        if req.trace_id.is_empty() {
            return Err(ServiceError::invalid_argument("trace_id is required"));
        }
        check_window(req.start_time_ms, req.end_time_ms)?;
        let tenants = self.config.platform_tenants(req.platform)?;

        let mut spans = self
            .repository
            .get_trace(&GetTraceParam {
                tenants: tenants.clone(),
                trace_id: req.trace_id,
                span_ids: req.span_ids,
                start_time: req.start_time_ms.saturating_mul(1_000),
                end_time: req.end_time_ms.saturating_mul(1_000),
                limit: GET_TRACE_LIMIT,
                ..Default::default()
            })
            .await?;
        sort_spans(&mut spans, SortOrder::Asc);
        self.post_process(req.platform, &tenants, &req.workspace_id, spans)
            .await
    }

    /// Trace lookup by trace id or log id over explicit tenants
    pub async fn search_trace_oapi(&self, req: SearchTraceOApiRequest) -> ServiceResult<Vec<Span>> {
        check_tenants(&req.tenants)?;
        if req.trace_id.is_empty() && req.log_id.is_empty() {
            return Err(ServiceError::invalid_argument(
                "either trace_id or log_id is required",
            ));
        }
        check_window(req.start_time_ms, req.end_time_ms)?;

        let limit = if req.limit == 0 {
            GET_TRACE_LIMIT
        } else {
            req.limit.min(GET_TRACE_LIMIT)
        };
        let mut spans = self
            .repository
            .get_trace(&GetTraceParam {
                tenants: req.tenants,
                trace_id: req.trace_id,
                log_id: (!req.log_id.is_empty()).then_some(req.log_id),
                start_time: req.start_time_ms.saturating_mul(1_000),
                end_time: req.end_time_ms.saturating_mul(1_000),
                limit,
                ..Default::default()
            })
            .await?;
        if !req.workspace_id.is_empty() {
            spans.retain(|s| s.workspace_id == req.workspace_id);
        }
        sort_spans(&mut spans, SortOrder::Asc);
        Ok(spans)
    }

    /// Token totals per trace; an empty request yields an empty result
    pub async fn get_traces_advance_info(
        &self,
        req: TracesAdvanceInfoRequest,
    ) -> ServiceResult<Vec<TraceAdvanceInfo>> {
        if req.traces.is_empty() {
            return Ok(Vec::new());
        }
        let tenants = self.config.platform_tenants(req.platform)?;
        advance::fan_out(
            Arc::clone(&self.repository),
            tenants,
            req.traces,
            self.advance_info_concurrency,
        )
        .await
    }

    /// Filterable fields of a `(platform, span list type)` view
    pub async fn get_traces_meta_info(
        &self,
        platform: PlatformType,
        span_list_type: &str,
    ) -> ServiceResult<HashMap<String, FieldMeta>> {
        let list_type = SpanListType::parse(span_list_type).ok_or_else(|| {
            ServiceError::invalid_argument(format!("unknown span list type: {span_list_type}"))
        })?;
        let catalog = self.config.field_meta_info()?;
        let names = catalog
            .field_metas
            .get(platform.as_str())
            .and_then(|by_type| by_type.get(list_type.as_str()))
            .ok_or_else(|| {
                ServiceError::invalid_argument(format!(
                    "no fields registered for {platform}/{list_type}"
                ))
            })?;

        names
            .iter()
            .map(|name| -> ServiceResult<(String, FieldMeta)> {
                let meta = catalog.available_fields.get(name).ok_or_else(|| {
                    tracing::error!(field = %name, "Registered field has no metadata");
                    ServiceError::internal(format!("no metadata for field {name}"))
                })?;
                Ok((name.clone(), meta.clone()))
            })
            .collect()
    }

    /// Annotations of one span, searched in a one second window around its start
    pub async fn list_annotations(
        &self,
        req: ListAnnotationsRequest,
    ) -> ServiceResult<Vec<Annotation>> {
        if req.trace_id.is_empty() || req.span_id.is_empty() {
            return Err(ServiceError::invalid_argument(
                "trace_id and span_id are required",
            ));
        }
        let tenants = self.config.platform_tenants(req.platform)?;
        let annotations = self
            .repository
            .list_annotations(&ListAnnotationsParam {
                tenants,
                workspace_id: req.workspace_id,
                trace_id: req.trace_id,
                span_id: req.span_id,
                start_time: req.start_time - LIST_ANNOTATIONS_WINDOW_MICROS,
                end_time: req.start_time + LIST_ANNOTATIONS_WINDOW_MICROS,
                include_deleted: req.include_deleted,
                desc_by_updated_at: req.desc_by_updated_at,
                limit: 0,
            })
            .await?;
        Ok(annotations)
    }

    /// Saved views selectable in the span list
    pub fn list_views(&self) -> ServiceResult<Vec<SystemView>> {
        self.config.system_views()
    }

    async fn post_process(
        &self,
        platform: PlatformType,
        tenants: &[String],
        workspace_id: &str,
        spans: Vec<Span>,
    ) -> ServiceResult<Vec<Span>> {
        let stages = self.processors.query_stages(platform.as_str())?;
        if stages.is_empty() {
            return Ok(spans);
        }
        let ctx = ProcessContext {
            tenant: tenants.first().cloned().unwrap_or_default(),
            workspace_id: (!workspace_id.is_empty()).then(|| workspace_id.to_string()),
        };
        run_stages(&stages, &ctx, spans).await
    }
}

fn rewritten(filters: Option<FilterFields>) -> ServiceResult<Option<FilterFields>> {
    filters
        .map(|mut f| -> ServiceResult<FilterFields> {
            rewrite_filters(&mut f)?;
            Ok(f)
        })
        .transpose()
}

fn check_window(start_ms: i64, end_ms: i64) -> ServiceResult<()> {
    if end_ms < start_ms {
        return Err(ServiceError::invalid_argument(format!(
            "end time {end_ms} is before start time {start_ms}"
        )));
    }
    Ok(())
}

fn check_tenants(tenants: &[String]) -> ServiceResult<()> {
    if tenants.is_empty() {
        return Err(ServiceError::invalid_argument("at least one tenant is required"));
    }
    Ok(())
}

fn clamp_limit(limit: usize) -> usize {
    limit.min(MAX_LIST_SPANS_LIMIT)
}
