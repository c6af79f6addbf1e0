//! Filter rewriting and builtin filters
//!
//! Client filters speak in product terms (`status`, millisecond latencies);
//! storage speaks in columns and microseconds. `rewrite_filters` bridges the
//! two before any query runs.

use crate::data::types::{
    COL_CALL_TYPE, COL_PARENT_ID, COL_SPAN_TYPE, COL_STATUS_CODE, COL_WORKSPACE_ID, FieldType,
    FilterField, FilterFields, PlatformType, QueryType, SPAN_TYPE_MODEL, SpanListType,
};
use crate::domain::error::{ServiceError, ServiceResult};

pub const FIELD_STATUS: &str = "status";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Fields clients send in milliseconds and storage keeps in microseconds
pub const LATENCY_FIELDS: &[&str] = &[
    "duration",
    "latency_first_resp",
    "start_time_first_resp",
    "start_time_first_token_resp",
    "latency_first_token_resp",
    "reasoning_duration",
];

const CALL_TYPE_PROMPT_PLAYGROUND: &str = "PromptPlayground";
const CALL_TYPE_PROMPT_DEBUG: &str = "PromptDebug";
const CALL_TYPE_EVALUATOR: &str = "Evaluator";
const CALL_TYPE_EVAL_TARGET: &str = "EvalTarget";

// ============================================================================
// REWRITE
// ============================================================================

/// Rewrite every leaf of `filters` into its storage form
pub fn rewrite_filters(filters: &mut FilterFields) -> ServiceResult<()> {
    filters.try_for_each_mut(&mut rewrite_field)
}

fn rewrite_field(field: &mut FilterField) -> ServiceResult<()> {
    if field.field_name == FIELD_STATUS {
        return rewrite_status(field);
    }
    if LATENCY_FIELDS.contains(&field.field_name.as_str()) {
        return rewrite_latency(field);
    }
    Ok(())
}

fn rewrite_status(field: &mut FilterField) -> ServiceResult<()> {
    let mut success = false;
    let mut error = false;
    for value in &field.values {
        match value.as_str() {
            STATUS_SUCCESS => success = true,
            STATUS_ERROR => error = true,
            other => {
                return Err(ServiceError::invalid_argument(format!(
                    "invalid status filter value: {other}"
                )));
            }
        }
    }

    let (query_type, values) = match (success, error) {
        (true, true) => (QueryType::AlwaysTrue, vec![]),
        (true, false) => (QueryType::Eq, vec!["0".to_string()]),
        (false, true) => (QueryType::NotEq, vec!["0".to_string()]),
        (false, false) => {
            return Err(ServiceError::invalid_argument("status filter has no values"));
        }
    };
    field.field_name = COL_STATUS_CODE.to_string();
    field.field_type = FieldType::Long;
    field.query_type = Some(query_type);
    field.values = values;
    Ok(())
}

fn rewrite_latency(field: &mut FilterField) -> ServiceResult<()> {
    for value in &mut field.values {
        let ms: i64 = value.trim().parse().map_err(|_| {
            ServiceError::invalid_argument(format!(
                "invalid {} filter value: {value}",
                field.field_name
            ))
        })?;
        *value = ms.saturating_mul(1_000).to_string();
    }
    Ok(())
}

// ============================================================================
// BUILTIN FILTERS
// ============================================================================

/// Filters a platform adds to every ListSpans call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltinFilter {
    /// Caller scoping; empty when the caller gave no workspace
    pub basic: Option<FilterFields>,
    /// Restriction of the platform itself
    pub platform: Option<FilterFields>,
    /// Selected by the span list type
    pub list: Option<FilterFields>,
    /// Query even when `basic` is empty
    pub force_query: bool,
}

impl BuiltinFilter {
    /// True when the call should return nothing without touching storage
    pub fn short_circuits(&self) -> bool {
        self.basic.as_ref().is_none_or(FilterFields::is_empty) && !self.force_query
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

fn leaf(name: &str, query_type: QueryType, values: &[&str]) -> FilterFields {
    FilterFields::and(vec![FilterField::new(
        name,
        FieldType::String,
        query_type,
        strings(values),
    )])
}

/// Workspace scoping shared by every platform
pub fn workspace_filter(workspace_id: &str) -> Option<FilterFields> {
    (!workspace_id.is_empty()).then(|| leaf(COL_WORKSPACE_ID, QueryType::Eq, &[workspace_id]))
}

/// Builtin filters of `platform` for a ListSpans over `list_type`
pub fn builtin_filter(
    platform: PlatformType,
    list_type: SpanListType,
    workspace_id: &str,
) -> BuiltinFilter {
    let platform_filter = match platform {
        PlatformType::Cozeloop => None,
        PlatformType::Prompt => Some(leaf(
            COL_CALL_TYPE,
            QueryType::In,
            &[CALL_TYPE_PROMPT_PLAYGROUND, CALL_TYPE_PROMPT_DEBUG],
        )),
        PlatformType::Evaluator => Some(leaf(COL_CALL_TYPE, QueryType::Eq, &[CALL_TYPE_EVALUATOR])),
        PlatformType::EvaluationTarget => {
            Some(leaf(COL_CALL_TYPE, QueryType::Eq, &[CALL_TYPE_EVAL_TARGET]))
        }
    };
    let list = match list_type {
        SpanListType::RootSpan => Some(leaf(COL_PARENT_ID, QueryType::In, &["", "0"])),
        SpanListType::LlmSpan => Some(leaf(COL_SPAN_TYPE, QueryType::Eq, &[SPAN_TYPE_MODEL])),
        SpanListType::AllSpan => None,
    };

    BuiltinFilter {
        basic: workspace_filter(workspace_id),
        force_query: platform_filter.is_some(),
        platform: platform_filter,
        list,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;

    fn field(name: &str, query_type: QueryType, values: &[&str]) -> FilterField {
        FilterField::new(name, FieldType::String, query_type, strings(values))
    }

    #[test]
    fn test_status_and_latency_rewrite() {
        let mut filters = FilterFields::and(vec![
            field("status", QueryType::In, &["success", "error"]),
            field("duration", QueryType::Gte, &["1500"]),
        ]);
        rewrite_filters(&mut filters).unwrap();

        let status = &filters.filter_fields[0];
        assert_eq!(status.field_name, "status_code");
        assert_eq!(status.query_type, Some(QueryType::AlwaysTrue));
        assert!(status.values.is_empty());

        let duration = &filters.filter_fields[1];
        assert_eq!(duration.field_name, "duration");
        assert_eq!(duration.query_type, Some(QueryType::Gte));
        assert_eq!(duration.values, vec!["1500000"]);
    }

    #[test]
    fn test_single_status_values() {
        let mut ok = FilterFields::and(vec![field("status", QueryType::In, &["success"])]);
        rewrite_filters(&mut ok).unwrap();
        assert_eq!(ok.filter_fields[0].query_type, Some(QueryType::Eq));
        assert_eq!(ok.filter_fields[0].values, vec!["0"]);

        let mut err = FilterFields::and(vec![field("status", QueryType::In, &["error"])]);
        rewrite_filters(&mut err).unwrap();
        assert_eq!(err.filter_fields[0].query_type, Some(QueryType::NotEq));
    }

    #[test]
    fn test_empty_or_unknown_status_is_invalid() {
        for values in [&[][..], &["pending"][..]] {
            let mut filters = FilterFields::and(vec![field("status", QueryType::In, values)]);
            let err = rewrite_filters(&mut filters).unwrap_err();
            assert!(err.is(ErrorKind::InvalidArgument));
        }
    }

    #[test]
    fn test_negative_latency_is_accepted() {
        let mut filters =
            FilterFields::and(vec![field("latency_first_resp", QueryType::Gt, &["-1"])]);
        rewrite_filters(&mut filters).unwrap();
        assert_eq!(filters.filter_fields[0].values, vec!["-1000"]);
    }

    #[test]
    fn test_unparseable_latency_is_invalid() {
        let mut filters = FilterFields::and(vec![FilterField::group(FilterFields::and(vec![
            field("reasoning_duration", QueryType::Lt, &["1.5"]),
        ]))]);
        let err = rewrite_filters(&mut filters).unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_builtin_filters() {
        let coze = builtin_filter(PlatformType::Cozeloop, SpanListType::RootSpan, "7");
        assert!(!coze.short_circuits());
        assert!(coze.platform.is_none());
        assert_eq!(coze.list.unwrap().filter_fields[0].values, vec!["", "0"]);

        let anonymous = builtin_filter(PlatformType::Cozeloop, SpanListType::AllSpan, "");
        assert!(anonymous.short_circuits());
        assert!(anonymous.list.is_none());

        let prompt = builtin_filter(PlatformType::Prompt, SpanListType::LlmSpan, "");
        assert!(!prompt.short_circuits());
        assert_eq!(
            prompt.platform.unwrap().filter_fields[0].values,
            vec!["PromptPlayground", "PromptDebug"]
        );
    }
}
