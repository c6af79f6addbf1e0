//! Attribute values
//!
//! The numeric accessors fall through representations in a fixed order
//! (`as_f64`: double, then int, then a parsed string). Tag typing depends on it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value as JsonValue;

use crate::data::types::TagValue;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
    Bytes(Vec<u8>),
    Array(Vec<AttrValue>),
    KvList(Vec<(String, AttrValue)>),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Double(v) if v.is_finite() => Some(*v as i64),
            Self::String(s) => {
                let s = s.trim();
                s.parse()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
            }
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::String(s) => Some(s == "true"),
            _ => None,
        }
    }

    /// Strings as-is; everything else rendered as JSON
    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            other => other.to_json().to_string(),
        }
    }

    /// String items of an array value; a JSON-array string is parsed; a scalar becomes one item
    pub fn as_string_array(&self) -> Vec<String> {
        match self {
            Self::Array(items) => items.iter().map(AttrValue::as_string).collect(),
            Self::String(s) => match serde_json::from_str::<Vec<JsonValue>>(s) {
                Ok(items) => items
                    .into_iter()
                    .map(|v| match v {
                        JsonValue::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
                Err(_) => vec![s.clone()],
            },
            other => vec![other.as_string()],
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::from(*v),
            Self::Double(v) => JsonValue::from(*v),
            Self::Bytes(b) => JsonValue::String(STANDARD.encode(b)),
            Self::Array(items) => JsonValue::Array(items.iter().map(AttrValue::to_json).collect()),
            Self::KvList(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Tag for an attribute nobody registered, typed by its wire variant
    pub fn to_wire_tag(&self) -> TagValue {
        match self {
            Self::String(s) => TagValue::String(s.clone()),
            Self::Bool(v) => TagValue::Bool(*v),
            Self::Int(v) => TagValue::Long(*v),
            Self::Double(v) => TagValue::Double(*v),
            other => TagValue::String(other.to_json().to_string()),
        }
    }
}
