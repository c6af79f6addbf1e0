//! Repository trait for span and annotation storage
//!
//! `TraceRepository` is implemented by the in-memory store (tests, local runs)
//! and by ClickHouse. Reads take a tenant list; a multi-tenant read merges the
//! tenants' rows before ordering and paging.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::data::error::DataError;
use crate::data::types::{Annotation, FilterFields, Span, TtlClass};

// ============================================================================
// PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Desc,
    Asc,
}

#[derive(Debug, Clone, Default)]
pub struct ListSpansParam {
    pub tenants: Vec<String>,
    /// Inclusive window over span start time, microseconds
    pub start_time: i64,
    pub end_time: i64,
    pub filters: Option<FilterFields>,
    pub limit: usize,
    pub order: SortOrder,
    pub page_token: Option<String>,
    /// Columns returned empty (e.g. `input`, `output`)
    pub omit_columns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListSpansResult {
    pub spans: Vec<Span>,
    pub next_page_token: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetTraceParam {
    pub tenants: Vec<String>,
    /// Matched when non-empty
    pub trace_id: String,
    /// Matched when `trace_id` is empty
    pub log_id: Option<String>,
    /// Restrict to these spans when non-empty
    pub span_ids: Vec<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub limit: usize,
    pub omit_columns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListAnnotationsParam {
    pub tenants: Vec<String>,
    pub workspace_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub include_deleted: bool,
    /// Newest `updated_at` first when true
    pub desc_by_updated_at: bool,
    pub limit: usize,
}

// ============================================================================
// PAGE TOKEN
// ============================================================================

/// Keyset cursor over `(start_time, span_id)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken {
    pub start_time: i64,
    pub span_id: String,
}

impl PageToken {
    pub fn after(span: &Span) -> Self {
        Self {
            start_time: span.start_time,
            span_id: span.span_id.clone(),
        }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.start_time, self.span_id))
    }

    pub fn decode(token: &str) -> Result<Self, DataError> {
        let invalid = || DataError::InvalidInput(format!("invalid page token: {token}"));
        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (start, span_id) = raw.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            start_time: start.parse().map_err(|_| invalid())?,
            span_id: span_id.to_string(),
        })
    }

    /// Whether `span` comes strictly after this cursor in `order`
    pub fn precedes(&self, span: &Span, order: SortOrder) -> bool {
        let key = (span.start_time, span.span_id.as_str());
        let cursor = (self.start_time, self.span_id.as_str());
        match order {
            SortOrder::Desc => key < cursor,
            SortOrder::Asc => key > cursor,
        }
    }
}

/// Order spans by `(start_time, span_id)` in the requested direction
pub fn sort_spans(spans: &mut [Span], order: SortOrder) {
    spans.sort_by(|a, b| {
        let ord = (a.start_time, &a.span_id).cmp(&(b.start_time, &b.span_id));
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}

/// Blank out omitted columns
pub fn apply_omit(span: &mut Span, omit: &[String]) {
    for column in omit {
        match column.as_str() {
            "input" => span.input.clear(),
            "output" => span.output.clear(),
            _ => {}
        }
    }
}

/// Trim an over-fetched page (limit + 1 rows) and derive the next token
pub fn finish_page(mut spans: Vec<Span>, limit: usize) -> ListSpansResult {
    let has_more = spans.len() > limit;
    spans.truncate(limit);
    let next_page_token = if has_more {
        spans.last().map(|s| PageToken::after(s).encode())
    } else {
        None
    };
    ListSpansResult {
        spans,
        next_page_token,
        has_more,
    }
}

/// Collapse rows sharing an ID to the newest by `updated_at`
pub fn latest_annotations(rows: Vec<Annotation>) -> Vec<Annotation> {
    let mut latest: std::collections::HashMap<String, Annotation> =
        std::collections::HashMap::new();
    for row in rows {
        match latest.get(&row.id) {
            Some(existing) if existing.updated_at > row.updated_at => {}
            _ => {
                latest.insert(row.id.clone(), row);
            }
        }
    }
    latest.into_values().collect()
}

// ============================================================================
// REPOSITORY
// ============================================================================

#[async_trait]
pub trait TraceRepository: Send + Sync {
    async fn insert_spans(&self, tenant: &str, ttl: TtlClass, spans: &[Span]) -> Result<(), DataError>;

    async fn list_spans(&self, param: &ListSpansParam) -> Result<ListSpansResult, DataError>;

    /// Spans of one trace, unordered
    async fn get_trace(&self, param: &GetTraceParam) -> Result<Vec<Span>, DataError>;

    async fn insert_annotations(
        &self,
        tenant: &str,
        annotations: &[Annotation],
    ) -> Result<(), DataError>;

    /// Latest row for `id`, tombstones included
    async fn get_annotation(
        &self,
        tenants: &[String],
        id: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Option<Annotation>, DataError>;

    async fn list_annotations(
        &self,
        param: &ListAnnotationsParam,
    ) -> Result<Vec<Annotation>, DataError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{AnnotationType, AnnotationValue, SpanTarget};

    fn span(start: i64, id: &str) -> Span {
        Span {
            trace_id: "t".to_string(),
            span_id: id.to_string(),
            start_time: start,
            ..Default::default()
        }
    }

    #[test]
    fn test_page_token_roundtrip() {
        let token = PageToken {
            start_time: 1_700_000_000_000_000,
            span_id: "ab:cd".to_string(),
        };
        assert_eq!(PageToken::decode(&token.encode()).unwrap(), token);
    }

    #[test]
    fn test_bad_page_token_is_invalid_input() {
        assert!(matches!(
            PageToken::decode("%%%"),
            Err(DataError::InvalidInput(_))
        ));
        let no_sep = URL_SAFE_NO_PAD.encode("12345");
        assert!(PageToken::decode(&no_sep).is_err());
    }

    #[test]
    fn test_sort_and_page() {
        let mut spans = vec![span(2, "b"), span(1, "a"), span(3, "c"), span(2, "a")];
        sort_spans(&mut spans, SortOrder::Desc);
        let ids: Vec<_> = spans.iter().map(|s| (s.start_time, s.span_id.as_str())).collect();
        assert_eq!(ids, vec![(3, "c"), (2, "b"), (2, "a"), (1, "a")]);

        let page = finish_page(spans.clone(), 2);
        assert!(page.has_more);
        assert_eq!(page.spans.len(), 2);
        let token = PageToken::decode(page.next_page_token.as_deref().unwrap()).unwrap();
        let rest: Vec<_> = spans
            .iter()
            .filter(|s| token.precedes(s, SortOrder::Desc))
            .map(|s| s.span_id.as_str())
            .collect();
        assert_eq!(rest, vec!["a", "a"]);
    }

    #[test]
    fn test_latest_annotations_keeps_newest() {
        let target = SpanTarget {
            workspace_id: "w".to_string(),
            trace_id: "t".to_string(),
            span_id: "s".to_string(),
            start_time: 1,
        };
        let mut old = Annotation::build(
            &target,
            AnnotationType::ManualFeedback,
            "k",
            AnnotationValue::Long(1),
            "",
            "u",
        );
        old.updated_at = 10;
        let mut new = old.clone();
        new.value = AnnotationValue::Long(2);
        new.updated_at = 20;
        let rows = latest_annotations(vec![new.clone(), old]);
        assert_eq!(rows, vec![new]);
    }
}
