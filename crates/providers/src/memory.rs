//! In-process cache store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{CacheError, CacheStore};

/// A [`CacheStore`] backed by a `HashMap` behind an async `RwLock`.
///
/// Entries never expire; share one instance (behind an `Arc`) across
/// orchestrators to reuse results between plan executions.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_owned(), value);
        Ok(())
    }
}
