//! Direct evaluation of a `FilterFields` tree against a span

use std::cmp::Ordering;

use crate::data::error::DataError;
use crate::data::types::{
    FieldType, FilterField, FilterFields, QueryRelation, QueryType, Span, TagValue,
};

/// Whether `span` satisfies `filter`; an empty node matches everything
pub fn matches(filter: &FilterFields, span: &Span) -> Result<bool, DataError> {
    if filter.is_empty() {
        return Ok(true);
    }
    match filter.query_and_or {
        QueryRelation::And => {
            for field in &filter.filter_fields {
                if !matches_field(field, span)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        QueryRelation::Or => {
            for field in &filter.filter_fields {
                if matches_field(field, span)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn matches_field(field: &FilterField, span: &Span) -> Result<bool, DataError> {
    let own = if field.field_name.is_empty() {
        None
    } else {
        Some(matches_leaf(field, span)?)
    };
    let sub = match &field.sub_filter {
        Some(sub) if !sub.is_empty() => Some(matches(sub, span)?),
        _ => None,
    };
    Ok(match (own, sub) {
        (Some(a), Some(b)) => match field.query_and_or.unwrap_or_default() {
            QueryRelation::And => a && b,
            QueryRelation::Or => a || b,
        },
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => true,
    })
}

fn matches_leaf(field: &FilterField, span: &Span) -> Result<bool, DataError> {
    let query_type = field.query_type.unwrap_or(QueryType::Eq);
    let value = span.field(&field.field_name);

    match query_type {
        QueryType::AlwaysTrue => Ok(true),
        QueryType::Exist => Ok(value.is_some_and(|v| !is_blank(&v))),
        QueryType::NotExist => Ok(value.is_none_or(|v| is_blank(&v))),
        QueryType::Eq | QueryType::In => any_equal(field, value.as_ref()),
        QueryType::NotEq | QueryType::NotIn => any_equal(field, value.as_ref()).map(|hit| !hit),
        QueryType::Match => Ok(contains(field, value.as_ref())),
        QueryType::NotMatch => Ok(!contains(field, value.as_ref())),
        QueryType::Gt | QueryType::Gte | QueryType::Lt | QueryType::Lte => {
            let Some(value) = value else {
                return Ok(false);
            };
            let Some(target) = field.values.first() else {
                return Err(DataError::InvalidInput(format!(
                    "filter on {} needs a value",
                    field.field_name
                )));
            };
            let ord = compare(field, &value, target)?;
            Ok(match query_type {
                QueryType::Gt => ord == Ordering::Greater,
                QueryType::Gte => ord != Ordering::Less,
                QueryType::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            })
        }
    }
}

fn is_blank(value: &TagValue) -> bool {
    matches!(value, TagValue::String(s) if s.is_empty())
}

fn any_equal(field: &FilterField, value: Option<&TagValue>) -> Result<bool, DataError> {
    let Some(value) = value else {
        return Ok(false);
    };
    for target in &field.values {
        if compare(field, value, target)? == Ordering::Equal {
            return Ok(true);
        }
    }
    Ok(false)
}

fn contains(field: &FilterField, value: Option<&TagValue>) -> bool {
    let Some(value) = value else {
        return false;
    };
    let haystack = value.to_filter_string();
    field.values.iter().any(|needle| haystack.contains(needle.as_str()))
}

/// Compare a span value against a filter literal using the declared field type
fn compare(field: &FilterField, value: &TagValue, target: &str) -> Result<Ordering, DataError> {
    let bad = || {
        DataError::InvalidInput(format!(
            "invalid {:?} value {target:?} for {}",
            field.field_type, field.field_name
        ))
    };
    match field.field_type {
        FieldType::String => Ok(value.to_filter_string().as_str().cmp(target)),
        FieldType::Long => {
            let target: i64 = target.parse().map_err(|_| bad())?;
            match value {
                TagValue::Long(v) => Ok(v.cmp(&target)),
                TagValue::Double(v) => Ok(v.partial_cmp(&(target as f64)).unwrap_or(Ordering::Less)),
                other => Ok(other
                    .to_filter_string()
                    .parse::<i64>()
                    .map(|v| v.cmp(&target))
                    .unwrap_or(Ordering::Less)),
            }
        }
        FieldType::Double => {
            let target: f64 = target.parse().map_err(|_| bad())?;
            let v = match value {
                TagValue::Long(v) => *v as f64,
                TagValue::Double(v) => *v,
                other => match other.to_filter_string().parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => return Ok(Ordering::Less),
                },
            };
            Ok(v.partial_cmp(&target).unwrap_or(Ordering::Less))
        }
        FieldType::Bool => {
            let target: bool = target.parse().map_err(|_| bad())?;
            match value {
                TagValue::Bool(v) => Ok(v.cmp(&target)),
                other => Ok(other.to_filter_string().as_str().cmp(&target.to_string())),
            }
        }
    }
}
