//! Parameterized WHERE-clause builder for span queries
//!
//! Every caller-controlled value (filter literals, tag keys, IDs, times) is
//! bound through `?` placeholders. Column names are checked against the span
//! column whitelist and table names against a strict identifier pattern.

use crate::data::error::DataError;
use crate::data::types::{
    FieldType, FilterField, FilterFields, QueryRelation, QueryType, TOP_LEVEL_COLUMNS,
};

// ============================================================================
// Parameterized Query Builder
// ============================================================================

/// Value bound to a `?` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
}

/// SQL fragments joined with AND, plus their parameters in placeholder order
#[derive(Debug, Default, Clone)]
pub struct ConditionBuilder {
    conditions: Vec<String>,
    params: Vec<QueryParam>,
}

impl ConditionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_eq(&mut self, column: &str, value: &str) {
        self.conditions.push(format!("{column} = ?"));
        self.params.push(QueryParam::String(value.to_string()));
    }

    pub fn add_in(&mut self, column: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.conditions.push(format!("{column} IN ({placeholders})"));
        self.params
            .extend(values.iter().cloned().map(QueryParam::String));
    }

    /// Inclusive `start_time` window
    pub fn add_time_range(&mut self, start: i64, end: i64) {
        self.conditions
            .push("start_time >= ? AND start_time <= ?".to_string());
        self.params.push(QueryParam::Int64(start));
        self.params.push(QueryParam::Int64(end));
    }

    /// Keyset condition over `(start_time, span_id)`
    pub fn add_cursor(&mut self, start_time: i64, span_id: &str, descending: bool) {
        let op = if descending { "<" } else { ">" };
        self.conditions
            .push(format!("(start_time, span_id) {op} (?, ?)"));
        self.params.push(QueryParam::Int64(start_time));
        self.params.push(QueryParam::String(span_id.to_string()));
    }

    pub fn add_filter(&mut self, filter: &FilterFields) -> Result<(), DataError> {
        if let Some((sql, params)) = compile_node(filter)? {
            self.conditions.push(sql);
            self.params.extend(params);
        }
        Ok(())
    }

    /// The clause without the `WHERE` keyword, `1 = 1` when empty
    pub fn build(&self) -> String {
        if self.conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            self.conditions.join(" AND ")
        }
    }

    pub fn params(&self) -> &[QueryParam] {
        &self.params
    }
}

/// Bind parameters in order
pub fn bind_all(
    mut query: clickhouse::query::Query,
    params: &[QueryParam],
) -> clickhouse::query::Query {
    for param in params {
        query = match param {
            QueryParam::String(s) => query.bind(s),
            QueryParam::Int64(i) => query.bind(i),
            QueryParam::Float64(f) => query.bind(f),
            QueryParam::Bool(b) => query.bind(b),
        };
    }
    query
}

/// Reject anything that is not a plain (optionally db-qualified) identifier
pub fn validate_identifier(name: &str) -> Result<&str, DataError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !name.starts_with('.')
        && !name.ends_with('.');
    if valid {
        Ok(name)
    } else {
        Err(DataError::Config(format!("invalid table name: {name:?}")))
    }
}

// ============================================================================
// FILTER COMPILATION
// ============================================================================

type Fragment = (String, Vec<QueryParam>);

fn compile_node(filter: &FilterFields) -> Result<Option<Fragment>, DataError> {
    let mut parts = Vec::new();
    let mut params = Vec::new();
    for field in &filter.filter_fields {
        if let Some((sql, p)) = compile_field(field)? {
            parts.push(sql);
            params.extend(p);
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    let joiner = match filter.query_and_or {
        QueryRelation::And => " AND ",
        QueryRelation::Or => " OR ",
    };
    Ok(Some((format!("({})", parts.join(joiner)), params)))
}

fn compile_field(field: &FilterField) -> Result<Option<Fragment>, DataError> {
    let own = if field.field_name.is_empty() {
        None
    } else {
        Some(compile_leaf(field)?)
    };
    let sub = match &field.sub_filter {
        Some(sub) => compile_node(sub)?,
        None => None,
    };
    Ok(match (own, sub) {
        (Some((a, mut pa)), Some((b, pb))) => {
            let joiner = match field.query_and_or.unwrap_or_default() {
                QueryRelation::And => "AND",
                QueryRelation::Or => "OR",
            };
            pa.extend(pb);
            Some((format!("({a} {joiner} {b})"), pa))
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    })
}

/// Column reference for a field; tag keys are bound, never inlined
fn column_expr(field: &FilterField) -> Fragment {
    if TOP_LEVEL_COLUMNS.contains(&field.field_name.as_str()) {
        return (field.field_name.clone(), Vec::new());
    }
    let bag = tag_bag(field.field_type);
    (
        format!("{bag}[?]"),
        vec![QueryParam::String(field.field_name.clone())],
    )
}

fn tag_bag(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "tags_string",
        FieldType::Long => "tags_long",
        FieldType::Double => "tags_double",
        FieldType::Bool => "tags_bool",
    }
}

fn literal(field: &FilterField, raw: &str) -> Result<QueryParam, DataError> {
    let bad = || {
        DataError::InvalidInput(format!(
            "invalid {:?} value {raw:?} for {}",
            field.field_type, field.field_name
        ))
    };
    Ok(match field.field_type {
        FieldType::String => QueryParam::String(raw.to_string()),
        FieldType::Long => QueryParam::Int64(raw.parse().map_err(|_| bad())?),
        FieldType::Double => QueryParam::Float64(raw.parse().map_err(|_| bad())?),
        FieldType::Bool => QueryParam::Bool(raw.parse().map_err(|_| bad())?),
    })
}

fn compile_leaf(field: &FilterField) -> Result<Fragment, DataError> {
    let query_type = field.query_type.unwrap_or(QueryType::Eq);
    let is_column = TOP_LEVEL_COLUMNS.contains(&field.field_name.as_str());
    let (expr, mut params) = column_expr(field);

    let sql = match query_type {
        QueryType::AlwaysTrue => return Ok(("1 = 1".to_string(), Vec::new())),
        QueryType::Exist | QueryType::NotExist => {
            let negate = query_type == QueryType::NotExist;
            if is_column {
                let op = if negate { "=" } else { "!=" };
                let empty = match field.field_type {
                    FieldType::String => "''",
                    _ => return Ok((if negate { "1 = 0" } else { "1 = 1" }.to_string(), Vec::new())),
                };
                format!("toString({expr}) {op} {empty}")
            } else {
                let bag = tag_bag(field.field_type);
                let not = if negate { "NOT " } else { "" };
                format!("{not}mapContains({bag}, ?)")
            }
        }
        QueryType::Eq | QueryType::NotEq | QueryType::Gt | QueryType::Gte | QueryType::Lt
        | QueryType::Lte => {
            let op = match query_type {
                QueryType::Eq => "=",
                QueryType::NotEq => "!=",
                QueryType::Gt => ">",
                QueryType::Gte => ">=",
                QueryType::Lt => "<",
                _ => "<=",
            };
            let raw = field.values.first().ok_or_else(|| {
                DataError::InvalidInput(format!("filter on {} needs a value", field.field_name))
            })?;
            params.push(literal(field, raw)?);
            format!("{expr} {op} ?")
        }
        QueryType::In | QueryType::NotIn => {
            if field.values.is_empty() {
                let sql = if query_type == QueryType::In { "1 = 0" } else { "1 = 1" };
                return Ok((sql.to_string(), Vec::new()));
            }
            for raw in &field.values {
                params.push(literal(field, raw)?);
            }
            let not = if query_type == QueryType::NotIn { "NOT " } else { "" };
            let placeholders = vec!["?"; field.values.len()].join(", ");
            format!("{expr} {not}IN ({placeholders})")
        }
        QueryType::Match | QueryType::NotMatch => {
            if field.values.is_empty() {
                return Ok(("1 = 1".to_string(), Vec::new()));
            }
            let mut ors = Vec::new();
            let mut all = Vec::new();
            for raw in &field.values {
                ors.push(format!("position(toString({expr}), ?) > 0"));
                all.extend(params.iter().cloned());
                all.push(QueryParam::String(raw.clone()));
            }
            let joined = format!("({})", ors.join(" OR "));
            let sql = if query_type == QueryType::NotMatch {
                format!("NOT {joined}")
            } else {
                joined
            };
            return Ok((sql, all));
        }
    };

    // mapContains binds the key itself; drop the expression's key param
    if matches!(query_type, QueryType::Exist | QueryType::NotExist) && !is_column {
        return Ok((sql, vec![QueryParam::String(field.field_name.clone())]));
    }
    Ok((sql, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, ty: FieldType, q: QueryType, values: &[&str]) -> FilterField {
        FilterField::new(name, ty, q, values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn test_column_and_tag_leaves() {
        let filter = FilterFields::and(vec![
            leaf("span_type", FieldType::String, QueryType::Eq, &["model"]),
            leaf("input_tokens", FieldType::Long, QueryType::Gte, &["10"]),
        ]);
        let mut builder = ConditionBuilder::new();
        builder.add_filter(&filter).unwrap();
        assert_eq!(builder.build(), "(span_type = ? AND tags_long[?] >= ?)");
        assert_eq!(
            builder.params(),
            &[
                QueryParam::String("model".to_string()),
                QueryParam::String("input_tokens".to_string()),
                QueryParam::Int64(10),
            ]
        );
    }

    #[test]
    fn test_in_and_nested_or() {
        let filter = FilterFields {
            query_and_or: QueryRelation::Or,
            filter_fields: vec![
                leaf("parent_id", FieldType::String, QueryType::In, &["", "0"]),
                FilterField::group(FilterFields::and(vec![leaf(
                    "stream",
                    FieldType::Bool,
                    QueryType::Eq,
                    &["true"],
                )])),
            ],
        };
        let mut builder = ConditionBuilder::new();
        builder.add_filter(&filter).unwrap();
        assert_eq!(
            builder.build(),
            "(parent_id IN (?, ?) OR (tags_bool[?] = ?))"
        );
        assert_eq!(builder.params().len(), 4);
    }

    #[test]
    fn test_exist_binds_key_once() {
        let filter = FilterFields::and(vec![leaf(
            "model_name",
            FieldType::String,
            QueryType::NotExist,
            &[],
        )]);
        let mut builder = ConditionBuilder::new();
        builder.add_filter(&filter).unwrap();
        assert_eq!(builder.build(), "(NOT mapContains(tags_string, ?))");
        assert_eq!(
            builder.params(),
            &[QueryParam::String("model_name".to_string())]
        );
    }

    #[test]
    fn test_match_repeats_key_per_value() {
        let filter = FilterFields::and(vec![leaf(
            "model_name",
            FieldType::String,
            QueryType::Match,
            &["gpt", "claude"],
        )]);
        let mut builder = ConditionBuilder::new();
        builder.add_filter(&filter).unwrap();
        assert_eq!(
            builder.build(),
            "((position(toString(tags_string[?]), ?) > 0 OR position(toString(tags_string[?]), ?) > 0))"
        );
        assert_eq!(builder.params().len(), 4);
    }

    #[test]
    fn test_always_true_and_time_range() {
        let mut builder = ConditionBuilder::new();
        builder.add_time_range(1, 2);
        builder
            .add_filter(&FilterFields::and(vec![leaf(
                "status_code",
                FieldType::Long,
                QueryType::AlwaysTrue,
                &[],
            )]))
            .unwrap();
        assert_eq!(builder.build(), "start_time >= ? AND start_time <= ? AND (1 = 1)");
    }

    #[test]
    fn test_bad_literal() {
        let filter = FilterFields::and(vec![leaf("duration", FieldType::Long, QueryType::Gt, &["x"])]);
        let mut builder = ConditionBuilder::new();
        assert!(matches!(
            builder.add_filter(&filter),
            Err(DataError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("db.spans_7d").is_ok());
        assert!(validate_identifier("spans; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }
}
