//! Trace domain logic
//!
//! - `normalize` - OTLP spans into canonical spans
//! - `processor` - Named span processing stages
//! - `ingest` - Batching spans onto the ingest topic and storing them
//! - `consumer` - Consumer registry with panic isolation
//! - `query` - Span listing, trace lookup and filter compilation
//! - `annotation` - Manual and automated annotations, with deferred retry
//! - `export` - Projecting spans into dataset rows
//! - `error` - Service error kinds and their HTTP mapping

pub mod annotation;
pub mod consumer;
pub mod error;
pub mod export;
pub mod ingest;
pub mod normalize;
pub mod processor;
pub mod query;

pub use error::{ErrorKind, ServiceError, ServiceResult};
