//! Row shapes for span and annotation tables
//!
//! `Map(K, V)` columns travel as `Vec<(K, V)>`.

use clickhouse::Row;
use serde::{Deserialize, Serialize};

use crate::data::types::{
    Annotation, AnnotationStatus, AnnotationType, AnnotationValue, Span,
};

/// Column list matching `SpanRow` field order
pub const SPAN_COLUMNS: &[&str] = &[
    "trace_id",
    "span_id",
    "parent_id",
    "workspace_id",
    "start_time",
    "duration",
    "span_name",
    "span_type",
    "status_code",
    "input",
    "output",
    "log_id",
    "call_type",
    "tags_string",
    "tags_long",
    "tags_double",
    "tags_bool",
    "system_tags_string",
];

/// Columns that may be returned blank for cost control
pub const OMITTABLE_COLUMNS: &[&str] = &["input", "output"];

/// Comma-separated select list, blanking omitted columns
pub fn span_select_list(omit: &[String]) -> String {
    SPAN_COLUMNS
        .iter()
        .map(|col| {
            if OMITTABLE_COLUMNS.contains(col) && omit.iter().any(|o| o == col) {
                format!("'' AS {col}")
            } else {
                (*col).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct SpanRow {
    pub trace_id: String,
    pub span_id: String,
    pub parent_id: String,
    pub workspace_id: String,
    pub start_time: i64,
    pub duration: i64,
    pub span_name: String,
    pub span_type: String,
    pub status_code: i32,
    pub input: String,
    pub output: String,
    pub log_id: String,
    pub call_type: String,
    pub tags_string: Vec<(String, String)>,
    pub tags_long: Vec<(String, i64)>,
    pub tags_double: Vec<(String, f64)>,
    pub tags_bool: Vec<(String, bool)>,
    pub system_tags_string: Vec<(String, String)>,
}

impl From<&Span> for SpanRow {
    fn from(span: &Span) -> Self {
        fn pairs<V: Clone>(map: &std::collections::BTreeMap<String, V>) -> Vec<(String, V)> {
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        }
        Self {
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
            parent_id: span.parent_id.clone(),
            workspace_id: span.workspace_id.clone(),
            start_time: span.start_time,
            duration: span.duration,
            span_name: span.span_name.clone(),
            span_type: span.span_type.clone(),
            status_code: span.status_code,
            input: span.input.clone(),
            output: span.output.clone(),
            log_id: span.log_id.clone(),
            call_type: span.call_type.clone(),
            tags_string: pairs(&span.tags_string),
            tags_long: pairs(&span.tags_long),
            tags_double: pairs(&span.tags_double),
            tags_bool: pairs(&span.tags_bool),
            system_tags_string: pairs(&span.system_tags_string),
        }
    }
}

impl From<SpanRow> for Span {
    fn from(row: SpanRow) -> Self {
        Self {
            trace_id: row.trace_id,
            span_id: row.span_id,
            parent_id: row.parent_id,
            workspace_id: row.workspace_id,
            start_time: row.start_time,
            duration: row.duration,
            span_name: row.span_name,
            span_type: row.span_type,
            status_code: row.status_code,
            input: row.input,
            output: row.output,
            log_id: row.log_id,
            call_type: row.call_type,
            tags_string: row.tags_string.into_iter().collect(),
            tags_long: row.tags_long.into_iter().collect(),
            tags_double: row.tags_double.into_iter().collect(),
            tags_bool: row.tags_bool.into_iter().collect(),
            system_tags_string: row.system_tags_string.into_iter().collect(),
        }
    }
}

pub const ANNOTATION_COLUMNS: &str = "id, workspace_id, trace_id, span_id, start_time, \
    annotation_type, key, value_type, value, reasoning, status, created_by, updated_by, \
    created_at, updated_at, is_deleted";

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct AnnotationRow {
    pub id: String,
    pub workspace_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub start_time: i64,
    pub annotation_type: String,
    pub key: String,
    pub value_type: String,
    pub value: String,
    pub reasoning: String,
    pub status: String,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_deleted: bool,
}

impl From<&Annotation> for AnnotationRow {
    fn from(a: &Annotation) -> Self {
        let (value_type, value) = a.value.to_storage();
        Self {
            id: a.id.clone(),
            workspace_id: a.workspace_id.clone(),
            trace_id: a.trace_id.clone(),
            span_id: a.span_id.clone(),
            start_time: a.start_time,
            annotation_type: a.annotation_type.as_str().to_string(),
            key: a.key.clone(),
            value_type: value_type.to_string(),
            value,
            reasoning: a.reasoning.clone(),
            status: a.status.as_str().to_string(),
            created_by: a.created_by.clone(),
            updated_by: a.updated_by.clone(),
            created_at: a.created_at,
            updated_at: a.updated_at,
            is_deleted: a.is_deleted,
        }
    }
}

impl AnnotationRow {
    /// `None` for rows with an annotation type this build does not know
    pub fn into_annotation(self) -> Option<Annotation> {
        let Some(annotation_type) = AnnotationType::parse(&self.annotation_type) else {
            tracing::warn!(
                id = %self.id,
                annotation_type = %self.annotation_type,
                "Skipping annotation row with unknown type"
            );
            return None;
        };
        let status = if self.status == AnnotationStatus::Deleted.as_str() {
            AnnotationStatus::Deleted
        } else {
            AnnotationStatus::Normal
        };
        Some(Annotation {
            id: self.id,
            workspace_id: self.workspace_id,
            trace_id: self.trace_id,
            span_id: self.span_id,
            start_time: self.start_time,
            annotation_type,
            key: self.key,
            value: AnnotationValue::from_storage(&self.value_type, self.value),
            reasoning: self.reasoning,
            status,
            created_by: self.created_by,
            updated_by: self.updated_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_deleted: self.is_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{SpanTarget, TagValue};

    #[test]
    fn test_span_row_keeps_bags() {
        let mut span = Span {
            trace_id: "t".to_string(),
            span_id: "s".to_string(),
            start_time: 5,
            ..Default::default()
        };
        span.set_tag("input_tokens", TagValue::Long(3));
        span.set_tag("stream", TagValue::Bool(true));
        span.system_tags_string
            .insert("tenant".to_string(), "default".to_string());

        let row = SpanRow::from(&span);
        assert_eq!(row.tags_long, vec![("input_tokens".to_string(), 3)]);
        assert_eq!(Span::from(row), span);
    }

    #[test]
    fn test_select_list_blanks_omitted() {
        let list = span_select_list(&["input".to_string(), "trace_id".to_string()]);
        assert!(list.contains("'' AS input"));
        assert!(list.contains("output"));
        assert!(list.starts_with("trace_id, "));
    }

    #[test]
    fn test_annotation_row_value_types() {
        let target = SpanTarget {
            workspace_id: "w".to_string(),
            trace_id: "t".to_string(),
            span_id: "s".to_string(),
            start_time: 9,
        };
        let annotation = Annotation::build(
            &target,
            AnnotationType::AutoEvaluator,
            "accuracy",
            AnnotationValue::Double(0.5),
            "ok",
            "evaluator",
        );
        let row = AnnotationRow::from(&annotation);
        assert_eq!(row.value_type, "double");
        assert_eq!(row.into_annotation().unwrap(), annotation);
    }

    #[test]
    fn test_unknown_annotation_type_skipped() {
        let target = SpanTarget::default();
        let annotation = Annotation::build(
            &target,
            AnnotationType::ManualFeedback,
            "k",
            AnnotationValue::default(),
            "",
            "u",
        );
        let mut row = AnnotationRow::from(&annotation);
        row.annotation_type = "something_else".to_string();
        assert!(row.into_annotation().is_none());
    }
}
