//! Span filter tree
//!
//! A `FilterFields` node combines its leaves with AND or OR. A leaf may carry a
//! nested `sub_filter`, combined with the leaf's own condition by the leaf's
//! `query_and_or` (a leaf with an empty field name is just its sub-filter).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryRelation {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Eq,
    NotEq,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Match,
    NotMatch,
    Exist,
    NotExist,
    AlwaysTrue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Long,
    Double,
    Bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterField {
    #[serde(default)]
    pub field_name: String,
    #[serde(default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub query_type: Option<QueryType>,
    #[serde(default)]
    pub query_and_or: Option<QueryRelation>,
    #[serde(default)]
    pub sub_filter: Option<FilterFields>,
}

impl FilterField {
    pub fn new(
        field_name: &str,
        field_type: FieldType,
        query_type: QueryType,
        values: Vec<String>,
    ) -> Self {
        Self {
            field_name: field_name.to_string(),
            field_type,
            values,
            query_type: Some(query_type),
            query_and_or: None,
            sub_filter: None,
        }
    }

    /// A leaf that only wraps a nested filter group
    pub fn group(sub_filter: FilterFields) -> Self {
        Self {
            sub_filter: Some(sub_filter),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterFields {
    #[serde(default)]
    pub query_and_or: QueryRelation,
    #[serde(default)]
    pub filter_fields: Vec<FilterField>,
}

impl FilterFields {
    pub fn and(filter_fields: Vec<FilterField>) -> Self {
        Self {
            query_and_or: QueryRelation::And,
            filter_fields,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filter_fields.is_empty()
    }

    /// AND-combine several optional filters, nesting each non-empty one as a group
    pub fn combine_and(filters: impl IntoIterator<Item = Option<FilterFields>>) -> Option<Self> {
        let groups: Vec<FilterField> = filters
            .into_iter()
            .flatten()
            .filter(|f| !f.is_empty())
            .map(FilterField::group)
            .collect();
        if groups.is_empty() {
            None
        } else {
            Some(Self::and(groups))
        }
    }

    /// Visit every leaf depth-first, stopping at the first error
    pub fn try_for_each_mut<E>(
        &mut self,
        f: &mut impl FnMut(&mut FilterField) -> Result<(), E>,
    ) -> Result<(), E> {
        for field in &mut self.filter_fields {
            f(field)?;
            if let Some(sub) = field.sub_filter.as_mut() {
                sub.try_for_each_mut(f)?;
            }
        }
        Ok(())
    }
}

/// Catalog entry describing how a field may be filtered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub field_type: FieldType,
    #[serde(default)]
    pub filter_types: Vec<QueryType>,
    #[serde(default)]
    pub field_options: Option<Vec<String>>,
    #[serde(default)]
    pub support_customizable_option: bool,
}

/// Field catalog: the available fields plus which of them each view exposes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMetaInfo {
    #[serde(default)]
    pub available_fields: HashMap<String, FieldMeta>,
    /// platform -> span list type -> field names
    #[serde(default)]
    pub field_metas: HashMap<String, HashMap<String, Vec<String>>>,
}
