//! Object store seam
//!
//! Large span bodies are promoted here and referenced by key from the span.
//! Only the in-process store ships with the server; a real bucket plugs in
//! behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::DataError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), DataError>;

    /// Missing key is `DataError::NotFound`
    async fn get(&self, key: &str) -> Result<Vec<u8>, DataError>;
}

/// Object key of an offloaded span attribute
pub fn span_attr_key(tenant: &str, trace_id: &str, span_id: &str, attr: &str) -> String {
    format!("{tenant}/{trace_id}/{span_id}/{attr}")
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Arc<Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn remove(&self, key: &str) {
        self.objects.remove(key);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), DataError> {
        self.objects.insert(key.to_string(), Arc::new(body));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, DataError> {
        self.objects
            .get(key)
            .map(|v| v.as_ref().clone())
            .ok_or_else(|| DataError::NotFound(format!("object {key}")))
    }
}
