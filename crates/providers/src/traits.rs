//! Collaborator contracts: backend descriptors, the executor and the cache.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CacheError, ProviderError};

fn default_concurrency_cap() -> usize {
    10
}

/// Registration record describing one implementation of a capability.
///
/// Defined here (in the providers crate) so both the engine's registry and
/// executor implementations can import it without a circular dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Capability category this backend serves, e.g. `"search"`.
    pub category: String,
    /// Opaque endpoint identifier handed back to the executor.
    pub endpoint: String,
    /// Methods this backend claims to support.
    #[serde(default)]
    pub methods: BTreeSet<String>,
    /// Maximum number of in-flight calls against this backend.
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: usize,
    /// Per-attempt timeout used when a node does not set its own.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retry budget used when a node does not set its own.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl BackendDescriptor {
    pub fn new(category: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            endpoint: endpoint.into(),
            methods: BTreeSet::new(),
            concurrency_cap: default_concurrency_cap(),
            timeout_ms: None,
            max_retries: None,
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency_cap(mut self, cap: usize) -> Self {
        self.concurrency_cap = cap;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn supports(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Performs the actual external operation behind a capability.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    /// Invoke `method` on `backend` with `params`.
    ///
    /// `timeout` is the budget for this single attempt; the engine enforces it
    /// as well, so implementations may use it only as a hint.
    async fn call(
        &self,
        backend: &BackendDescriptor,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, ProviderError>;

    /// Probe whether `backend` is currently able to serve calls.
    async fn health_check(&self, _backend: &BackendDescriptor) -> bool {
        true
    }
}

/// Key/value store used to memoise node results.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_apply_when_deserialising() {
        let descriptor: BackendDescriptor =
            serde_json::from_str(r#"{ "category": "search", "endpoint": "es-1", "methods": ["query"] }"#)
                .expect("valid descriptor");

        assert!(descriptor.supports("query"));
        assert!(!descriptor.supports("index"));
        assert_eq!(descriptor.concurrency_cap, 10);
        assert_eq!(descriptor.timeout(), None);
        assert_eq!(descriptor.max_retries, None);

        let tuned = descriptor.with_timeout(Duration::from_millis(250)).with_max_retries(1);
        assert_eq!(tuned.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(tuned.max_retries, Some(1));
    }
}
