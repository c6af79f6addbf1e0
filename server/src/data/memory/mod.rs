//! In-process trace store
//!
//! Tenant-partitioned vectors behind a `parking_lot::RwLock`. Filters are
//! evaluated directly against spans. Used by tests and single-process runs.

mod filter;

pub use filter::matches;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::core::constants::DEFAULT_LIST_SPANS_LIMIT;
use crate::data::error::DataError;
use crate::data::traits::{
    GetTraceParam, ListAnnotationsParam, ListSpansParam, ListSpansResult, PageToken,
    TraceRepository, apply_omit, finish_page, sort_spans,
};
use crate::data::types::{Annotation, Span, TtlClass};

#[derive(Default)]
struct TenantStore {
    spans: Vec<Span>,
    /// Keyed by annotation ID; a same-ID write replaces the row
    annotations: HashMap<String, Annotation>,
}

#[derive(Default)]
pub struct MemoryTraceRepository {
    tenants: RwLock<HashMap<String, TenantStore>>,
}

impl MemoryTraceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total annotation rows stored for `tenant`, tombstones included
    pub fn annotation_count(&self, tenant: &str) -> usize {
        self.tenants
            .read()
            .get(tenant)
            .map(|t| t.annotations.len())
            .unwrap_or(0)
    }

    pub fn span_count(&self, tenant: &str) -> usize {
        self.tenants
            .read()
            .get(tenant)
            .map(|t| t.spans.len())
            .unwrap_or(0)
    }

    fn collect_spans(
        &self,
        tenants: &[String],
        mut keep: impl FnMut(&Span) -> Result<bool, DataError>,
    ) -> Result<Vec<Span>, DataError> {
        let guard = self.tenants.read();
        let mut out = Vec::new();
        for tenant in tenants {
            let Some(store) = guard.get(tenant) else {
                continue;
            };
            for span in &store.spans {
                if keep(span)? {
                    out.push(span.clone());
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl TraceRepository for MemoryTraceRepository {
    async fn insert_spans(&self, tenant: &str, ttl: TtlClass, spans: &[Span]) -> Result<(), DataError> {
        if spans.is_empty() {
            return Ok(());
        }
        let mut guard = self.tenants.write();
        let store = guard.entry(tenant.to_string()).or_default();
        for span in spans {
            // Same (span_id, start_time) replaces the stored row
            match store
                .spans
                .iter_mut()
                .find(|s| s.span_id == span.span_id && s.start_time == span.start_time)
            {
                Some(existing) => *existing = span.clone(),
                None => store.spans.push(span.clone()),
            }
        }
        tracing::debug!(tenant, ttl = %ttl, count = spans.len(), "Stored spans");
        Ok(())
    }

    async fn list_spans(&self, param: &ListSpansParam) -> Result<ListSpansResult, DataError> {
        let cursor = param
            .page_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(PageToken::decode)
            .transpose()?;
        let limit = if param.limit == 0 {
            DEFAULT_LIST_SPANS_LIMIT
        } else {
            param.limit
        };

        let mut spans = self.collect_spans(&param.tenants, |span| {
            if span.start_time < param.start_time || span.start_time > param.end_time {
                return Ok(false);
            }
            if let Some(cursor) = &cursor
                && !cursor.precedes(span, param.order)
            {
                return Ok(false);
            }
            match &param.filters {
                Some(filter) => matches(filter, span),
                None => Ok(true),
            }
        })?;

        sort_spans(&mut spans, param.order);
        spans.truncate(limit + 1);
        for span in &mut spans {
            apply_omit(span, &param.omit_columns);
        }
        Ok(finish_page(spans, limit))
    }

    async fn get_trace(&self, param: &GetTraceParam) -> Result<Vec<Span>, DataError> {
        let mut spans = self.collect_spans(&param.tenants, |span| {
            if span.start_time < param.start_time || span.start_time > param.end_time {
                return Ok(false);
            }
            let id_hit = if !param.trace_id.is_empty() {
                span.trace_id == param.trace_id
            } else {
                match param.log_id.as_deref() {
                    Some(log_id) if !log_id.is_empty() => span.log_id == log_id,
                    _ => false,
                }
            };
            Ok(id_hit && (param.span_ids.is_empty() || param.span_ids.contains(&span.span_id)))
        })?;
        if param.limit > 0 {
            spans.truncate(param.limit);
        }
        for span in &mut spans {
            apply_omit(span, &param.omit_columns);
        }
        Ok(spans)
    }

    async fn insert_annotations(
        &self,
        tenant: &str,
        annotations: &[Annotation],
    ) -> Result<(), DataError> {
        let mut guard = self.tenants.write();
        let store = guard.entry(tenant.to_string()).or_default();
        for annotation in annotations {
            match store.annotations.get(&annotation.id) {
                Some(existing) if existing.updated_at > annotation.updated_at => {}
                _ => {
                    store
                        .annotations
                        .insert(annotation.id.clone(), annotation.clone());
                }
            }
        }
        Ok(())
    }

    async fn get_annotation(
        &self,
        tenants: &[String],
        id: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Option<Annotation>, DataError> {
        let guard = self.tenants.read();
        Ok(tenants
            .iter()
            .filter_map(|t| guard.get(t))
            .filter_map(|store| store.annotations.get(id))
            .filter(|a| a.start_time >= start_time && a.start_time <= end_time)
            .max_by_key(|a| a.updated_at)
            .cloned())
    }

    async fn list_annotations(
        &self,
        param: &ListAnnotationsParam,
    ) -> Result<Vec<Annotation>, DataError> {
        let guard = self.tenants.read();
        let mut rows: Vec<Annotation> = tenants_annotations(&guard, &param.tenants)
            .filter(|a| {
                (param.workspace_id.is_empty() || a.workspace_id == param.workspace_id)
                    && (param.trace_id.is_empty() || a.trace_id == param.trace_id)
                    && (param.span_id.is_empty() || a.span_id == param.span_id)
                    && a.start_time >= param.start_time
                    && a.start_time <= param.end_time
                    && (param.include_deleted || !a.is_deleted)
            })
            .cloned()
            .collect();
        if param.desc_by_updated_at {
            rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        } else {
            rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        }
        if param.limit > 0 {
            rows.truncate(param.limit);
        }
        Ok(rows)
    }
}

fn tenants_annotations<'a>(
    guard: &'a HashMap<String, TenantStore>,
    tenants: &'a [String],
) -> impl Iterator<Item = &'a Annotation> {
    tenants
        .iter()
        .filter_map(|t| guard.get(t))
        .flat_map(|store| store.annotations.values())
}
