//! Annotation model
//!
//! Annotations are content-addressed: the ID is derived from the target span
//! tuple plus key and type, so a write with the same content is an upsert and a
//! delete is a tombstone insert.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::constants::ANNOTATION_ID_LEN;

/// Origin of an annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationType {
    ManualFeedback,
    ManualDataset,
    ManualEvaluationSet,
    AutoEvaluator,
    AutoCorrection,
}

impl AnnotationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualFeedback => "manual_feedback",
            Self::ManualDataset => "manual_dataset",
            Self::ManualEvaluationSet => "manual_evaluation_set",
            Self::AutoEvaluator => "auto_evaluator",
            Self::AutoCorrection => "auto_correction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual_feedback" => Some(Self::ManualFeedback),
            "manual_dataset" => Some(Self::ManualDataset),
            "manual_evaluation_set" => Some(Self::ManualEvaluationSet),
            "auto_evaluator" => Some(Self::AutoEvaluator),
            "auto_correction" => Some(Self::AutoCorrection),
            _ => None,
        }
    }
}

impl fmt::Display for AnnotationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationStatus {
    #[default]
    Normal,
    Deleted,
}

impl AnnotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Deleted => "deleted",
        }
    }
}

/// Typed annotation value. JSON payloads are kept as their encoded string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AnnotationValue {
    String(String),
    Long(i64),
    Double(f64),
    Bool(bool),
    Json(String),
}

impl Default for AnnotationValue {
    fn default() -> Self {
        AnnotationValue::String(String::new())
    }
}

impl AnnotationValue {
    pub fn value_type(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::Bool(_) => "bool",
            Self::Json(_) => "json",
        }
    }

    /// Flatten into the (type, string) pair stored by columnar backends
    pub fn to_storage(&self) -> (&'static str, String) {
        let raw = match self {
            Self::String(s) | Self::Json(s) => s.clone(),
            Self::Long(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
        };
        (self.value_type(), raw)
    }

    /// Inverse of [`Self::to_storage`]; unparseable numbers fall back to a string value
    pub fn from_storage(value_type: &str, raw: String) -> Self {
        match value_type {
            "long" => raw
                .parse()
                .map(Self::Long)
                .unwrap_or(Self::String(raw)),
            "double" => raw
                .parse()
                .map(Self::Double)
                .unwrap_or(Self::String(raw)),
            "bool" => Self::Bool(raw == "true"),
            "json" => Self::Json(raw),
            _ => Self::String(raw),
        }
    }
}

/// The span an annotation is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanTarget {
    pub workspace_id: String,
    pub trace_id: String,
    pub span_id: String,
    /// Span start time in microseconds
    pub start_time: i64,
}

/// Deterministic annotation ID over target tuple, key and type
pub fn annotation_id(target: &SpanTarget, key: &str, annotation_type: AnnotationType) -> String {
    let mut hasher = Sha256::new();
    for part in [
        target.workspace_id.as_str(),
        target.trace_id.as_str(),
        target.span_id.as_str(),
        &target.start_time.to_string(),
        key,
        annotation_type.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    let digest = hex::encode(hasher.finalize());
    digest[..ANNOTATION_ID_LEN].to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub workspace_id: String,
    pub trace_id: String,
    pub span_id: String,
    /// Start time of the annotated span in microseconds
    pub start_time: i64,
    pub annotation_type: AnnotationType,
    pub key: String,
    #[serde(default)]
    pub value: AnnotationValue,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub status: AnnotationStatus,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub updated_by: String,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Annotation {
    /// Build a fresh annotation stamped with the current time
    pub fn build(
        target: &SpanTarget,
        annotation_type: AnnotationType,
        key: &str,
        value: AnnotationValue,
        reasoning: &str,
        user_id: &str,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: annotation_id(target, key, annotation_type),
            workspace_id: target.workspace_id.clone(),
            trace_id: target.trace_id.clone(),
            span_id: target.span_id.clone(),
            start_time: target.start_time,
            annotation_type,
            key: key.to_string(),
            value,
            reasoning: reasoning.to_string(),
            status: AnnotationStatus::Normal,
            created_by: user_id.to_string(),
            updated_by: user_id.to_string(),
            created_at: now,
            updated_at: now,
            is_deleted: false,
        }
    }

    pub fn target(&self) -> SpanTarget {
        SpanTarget {
            workspace_id: self.workspace_id.clone(),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            start_time: self.start_time,
        }
    }

    /// Move the annotation onto a span's authoritative start time, rederiving the ID
    pub fn rebind(&mut self, start_time: i64) {
        self.start_time = start_time;
        self.id = annotation_id(&self.target(), &self.key, self.annotation_type);
    }

    /// Turn this row into a tombstone
    pub fn mark_deleted(&mut self, user_id: &str) {
        self.is_deleted = true;
        self.status = AnnotationStatus::Deleted;
        self.updated_by = user_id.to_string();
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
