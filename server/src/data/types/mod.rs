//! Shared data types
//!
//! Types used by the storage backends, the broker payloads and the domain
//! services alike.

mod annotation;
mod filter;
mod platform;
mod span;

pub use annotation::{
    Annotation, AnnotationStatus, AnnotationType, AnnotationValue, SpanTarget, annotation_id,
};
pub use filter::{
    FieldMeta, FieldMetaInfo, FieldType, FilterField, FilterFields, QueryRelation, QueryType,
};
pub use platform::{PlatformType, SpanListType};
pub use span::*;
