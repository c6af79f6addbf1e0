//! Span field extraction and content conversion

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::data::types::{COL_INPUT, COL_OUTPUT, Span};

/// Prefix selecting a tag from any bag
const TAG_PREFIX: &str = "tags.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    Audio,
    MultiPart,
}

/// Typed cell of a dataset row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum FieldContent {
    Text { text: String },
    Image { url: String, name: String },
    Audio { url: String },
    MultiPart { parts: Vec<Value> },
}

/// Raw value of `key` on `span` as JSON.
///
/// Input and output are parsed when they hold JSON, so a path can descend into
/// them. Missing tags and unknown keys read as null.
pub fn field_value(span: &Span, key: &str) -> Value {
    if key == COL_INPUT || key == COL_OUTPUT {
        let raw = if key == COL_INPUT { &span.input } else { &span.output };
        return serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
    }
    let found = match key.strip_prefix(TAG_PREFIX) {
        Some(tag) => span.tag(tag),
        None => span.column(key),
    };
    found.map(|v| v.to_json()).unwrap_or(Value::Null)
}

/// Evaluate `path` against `value`; an empty path selects the whole value.
///
/// A failed evaluation yields null rather than an error. Several matches are
/// returned as an array.
pub fn extract(value: &Value, path: &str) -> Value {
    if path.trim().is_empty() {
        return value.clone();
    }
    match jsonpath_lib::select(value, path) {
        Ok(mut hits) => match hits.len() {
            0 => Value::Null,
            1 => hits.remove(0).clone(),
            _ => Value::Array(hits.into_iter().cloned().collect()),
        },
        Err(e) => {
            tracing::debug!(path, error = %e, "JSONPath evaluation failed, using empty value");
            Value::Null
        }
    }
}

/// Convert an extracted value into `content_type`; the error is a short reason
pub fn convert(value: Value, content_type: ContentType) -> Result<FieldContent, String> {
    match content_type {
        ContentType::Text => Ok(FieldContent::Text {
            text: match value {
                Value::Null => String::new(),
                Value::String(s) => s,
                other => other.to_string(),
            },
        }),
        ContentType::Image => {
            let (url, name) = media_url(&value).ok_or("image needs a url")?;
            Ok(FieldContent::Image { url, name })
        }
        ContentType::Audio => {
            let (url, _) = media_url(&value).ok_or("audio needs a url")?;
            Ok(FieldContent::Audio { url })
        }
        ContentType::MultiPart => {
            let parts = match value {
                Value::Array(parts) => parts,
                Value::String(s) => match serde_json::from_str::<Value>(&s) {
                    Ok(Value::Array(parts)) => parts,
                    _ => return Err("multipart needs a JSON array".to_string()),
                },
                _ => return Err("multipart needs a JSON array".to_string()),
            };
            if !parts.iter().all(|p| p.get("type").is_some_and(Value::is_string)) {
                return Err("every multipart part needs a type".to_string());
            }
            Ok(FieldContent::MultiPart { parts })
        }
    }
}

/// Media fields need an absolute http(s) URL with a host
fn media_url(value: &Value) -> Option<(String, String)> {
    let (raw, name) = match value {
        Value::String(s) => (s.as_str(), ""),
        Value::Object(map) => (
            map.get("url")?.as_str()?,
            map.get("name").and_then(Value::as_str).unwrap_or_default(),
        ),
        _ => return None,
    };
    let parsed = Url::parse(raw).ok()?;
    if !matches!(parsed.scheme(), "http" | "https")
        || parsed.host_str().is_none_or(str::is_empty)
    {
        return None;
    }
    Some((raw.to_string(), name.to_string()))
}
