//! Capability registry: maps a category to its registered backends.
//!
//! Read-mostly: `resolve` takes a shared lock and clones an `Arc`, so
//! `register` calls may interleave freely with in-flight plans.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use indexmap::IndexMap;
use providers::{BackendDescriptor, CapabilityExecutor};
use serde::Serialize;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

/// A descriptor plus the live state the registry keeps for it.
#[derive(Debug)]
pub struct RegisteredBackend {
    descriptor: BackendDescriptor,
    healthy: AtomicBool,
    /// Effective slot count: `descriptor.concurrency_cap` within tokio's permit range.
    cap: usize,
    permits: Arc<Semaphore>,
}

impl RegisteredBackend {
    fn new(descriptor: BackendDescriptor) -> Self {
        let cap = descriptor.concurrency_cap.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            descriptor,
            healthy: AtomicBool::new(true),
            cap,
            permits: Arc::new(Semaphore::new(cap)),
        }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Wait for a call slot on this backend.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.permits).acquire_owned().await
    }

    pub fn health(&self) -> BackendHealth {
        BackendHealth {
            endpoint: self.descriptor.endpoint.clone(),
            methods: self.descriptor.methods.iter().cloned().collect(),
            healthy: self.is_healthy(),
            concurrency_cap: self.cap,
            in_flight: self.cap.saturating_sub(self.permits.available_permits()),
        }
    }
}

/// Health-surface view of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub endpoint: String,
    pub methods: Vec<String>,
    pub healthy: bool,
    pub concurrency_cap: usize,
    pub in_flight: usize,
}

/// Category → backends, in registration order.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    buckets: RwLock<IndexMap<String, Vec<Arc<RegisteredBackend>>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend to its category bucket.  New backends start healthy.
    pub fn register(&self, descriptor: BackendDescriptor) -> Arc<RegisteredBackend> {
        info!(
            category = %descriptor.category,
            endpoint = %descriptor.endpoint,
            methods = ?descriptor.methods,
            "registering backend"
        );
        let backend = Arc::new(RegisteredBackend::new(descriptor));
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(backend.descriptor.category.clone())
            .or_default()
            .push(Arc::clone(&backend));
        backend
    }

    /// Pick a healthy backend for `(category, method)`.
    ///
    /// Prefers the first healthy backend that lists `method`; otherwise falls
    /// back to the first healthy backend of the category.
    pub fn resolve(&self, category: &str, method: &str) -> Option<Arc<RegisteredBackend>> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.get(category)?;

        let mut healthy = bucket.iter().filter(|b| b.is_healthy());
        let chosen = healthy
            .clone()
            .find(|b| b.descriptor.supports(method))
            .or_else(|| healthy.next())
            .cloned();
        chosen
    }

    /// Flip the health flag of one backend.  Returns `false` if no backend
    /// matches.
    pub fn set_healthy(&self, category: &str, endpoint: &str, healthy: bool) -> bool {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let Some(backend) = buckets
            .get(category)
            .and_then(|bucket| bucket.iter().find(|b| b.descriptor.endpoint == endpoint))
        else {
            return false;
        };
        backend.set_healthy(healthy);
        true
    }

    pub fn categories(&self) -> Vec<String> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn all_backends(&self) -> Vec<Arc<RegisteredBackend>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Re-probe every backend concurrently and record the outcome.
    ///
    /// Returns the number of backends found healthy.
    pub async fn health_check_all(&self, executor: &dyn CapabilityExecutor) -> usize {
        let backends = self.all_backends();
        let probes = backends.iter().map(|backend| async move {
            let healthy = executor.health_check(&backend.descriptor).await;
            if !healthy && backend.is_healthy() {
                warn!(
                    category = %backend.descriptor.category,
                    endpoint = %backend.descriptor.endpoint,
                    "backend failed health probe"
                );
            }
            backend.set_healthy(healthy);
            healthy
        });

        join_all(probes).await.into_iter().filter(|ok| *ok).count()
    }

    /// Health view of every backend grouped by category.
    pub fn snapshot(&self) -> IndexMap<String, Vec<BackendHealth>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(category, bucket)| (category.clone(), bucket.iter().map(|b| b.health()).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use providers::mock::MockExecutor;

    fn search(endpoint: &str, methods: &[&str]) -> BackendDescriptor {
        BackendDescriptor::new("search", endpoint).with_methods(methods.iter().copied())
    }

    #[test]
    fn resolve_prefers_backend_supporting_method() {
        let registry = CapabilityRegistry::new();
        registry.register(search("es-1", &["index"]));
        registry.register(search("es-2", &["query"]));

        let backend = registry.resolve("search", "query").expect("backend");
        assert_eq!(backend.descriptor().endpoint, "es-2");
    }

    #[test]
    fn resolve_falls_back_to_first_healthy_in_category() {
        let registry = CapabilityRegistry::new();
        registry.register(search("es-1", &["index"]));
        registry.register(search("es-2", &["index"]));

        let backend = registry.resolve("search", "query").expect("fallback backend");
        assert_eq!(backend.descriptor().endpoint, "es-1");
    }

    #[test]
    fn resolve_skips_unhealthy_backends() {
        let registry = CapabilityRegistry::new();
        registry.register(search("es-1", &["query"]));
        registry.register(search("es-2", &[]));
        assert!(registry.set_healthy("search", "es-1", false));

        let backend = registry.resolve("search", "query").expect("fallback backend");
        assert_eq!(backend.descriptor().endpoint, "es-2");

        assert!(registry.set_healthy("search", "es-2", false));
        assert!(registry.resolve("search", "query").is_none());
    }

    #[test]
    fn resolve_unknown_category_is_none() {
        let registry = CapabilityRegistry::new();
        registry.register(search("es-1", &["query"]));
        assert!(registry.resolve("database", "query").is_none());
        assert!(!registry.set_healthy("database", "pg", false));
    }

    #[tokio::test]
    async fn oversized_concurrency_cap_is_clamped() {
        let registry = CapabilityRegistry::new();
        let backend = registry.register(search("es-1", &["query"]).with_concurrency_cap(usize::MAX));
        let zero = registry.register(search("es-2", &["query"]).with_concurrency_cap(0));

        let health = backend.health();
        assert_eq!(health.concurrency_cap, Semaphore::MAX_PERMITS);
        assert_eq!(health.in_flight, 0);
        assert_eq!(zero.health().concurrency_cap, 1);

        let _slot = backend.acquire().await.expect("slot");
        assert_eq!(backend.health().in_flight, 1);
    }

    #[tokio::test]
    async fn health_check_all_updates_flags() {
        let registry = CapabilityRegistry::new();
        registry.register(search("es-1", &["query"]));
        registry.register(search("es-2", &["query"]));
        let executor = MockExecutor::new().with_unhealthy("es-1");

        let healthy = registry.health_check_all(&executor).await;
        assert_eq!(healthy, 1);

        let snapshot = registry.snapshot();
        let flags: Vec<(String, bool)> = snapshot["search"]
            .iter()
            .map(|b| (b.endpoint.clone(), b.healthy))
            .collect();
        assert_eq!(flags, vec![("es-1".to_owned(), false), ("es-2".to_owned(), true)]);
        assert_eq!(registry.resolve("search", "query").unwrap().descriptor().endpoint, "es-2");
    }

    #[tokio::test]
    async fn register_interleaves_with_resolve() {
        let registry = Arc::new(CapabilityRegistry::new());
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.register(search(&format!("es-{i}"), &["query"]));
                    registry.resolve("search", "query").is_some()
                })
            })
            .collect();

        for writer in writers {
            assert!(writer.await.unwrap());
        }
        assert_eq!(registry.snapshot()["search"].len(), 8);
    }
}
