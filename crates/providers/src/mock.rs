//! Test doubles for [`CapabilityExecutor`] and [`CacheStore`].
//!
//! Useful in unit and integration tests where a real backend is either
//! unavailable or irrelevant.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::{BackendDescriptor, CacheError, CacheStore, CapabilityExecutor, ProviderError};

/// Behaviour injected into `MockExecutor` per method.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Sleep for the given duration, then return the value.
    Delayed(Duration, Value),
    /// Fail with a transient `Executor` error.
    FailRetryable(String),
    /// Fail with a `Timeout` error.
    FailTimeout,
    /// Fail with a permanent `Rejected` error.
    Reject(String),
    /// Fail transiently `failures` times, then return the value.
    FailThenReturn { failures: usize, value: Value },
    /// Panic inside the call.
    Panic(String),
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub endpoint: String,
    pub method: String,
    pub params: Value,
    /// Virtual-clock friendly timestamp of the attempt.
    pub at: Instant,
}

/// A mock executor that records every call it receives and answers with a
/// programmer-specified behaviour, keyed by method name.
///
/// Methods with no scripted behaviour are rejected.
#[derive(Default)]
pub struct MockExecutor {
    behaviours: HashMap<String, MockBehaviour>,
    unhealthy: HashSet<String>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour for `method`.
    pub fn on(mut self, method: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.behaviours.insert(method.into(), behaviour);
        self
    }

    /// Make `health_check` report `endpoint` as down.
    pub fn with_unhealthy(mut self, endpoint: impl Into<String>) -> Self {
        self.unhealthy.insert(endpoint.into());
        self
    }

    /// Total number of calls across all methods.
    pub fn call_count(&self) -> usize {
        self.log().len()
    }

    /// Number of calls made for `method`.
    pub fn calls_for(&self, method: &str) -> usize {
        self.log()
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Attempt timestamps for `method`, in call order.
    pub fn call_instants(&self, method: &str) -> Vec<Instant> {
        self.log()
            .iter()
            .filter(|c| c.method == method)
            .map(|c| c.at)
            .collect()
    }

    /// All recorded calls in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.log().clone()
    }

    /// Highest number of calls observed in flight at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn log(&self) -> MutexGuard<'_, Vec<MockCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, backend: &BackendDescriptor, method: &str, params: &Value) -> usize {
        let mut calls = self.log();
        calls.push(MockCall {
            endpoint: backend.endpoint.clone(),
            method: method.to_owned(),
            params: params.clone(),
            at: Instant::now(),
        });
        calls.iter().filter(|c| c.method == method).count()
    }
}

#[async_trait]
impl CapabilityExecutor for MockExecutor {
    async fn call(
        &self,
        backend: &BackendDescriptor,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, ProviderError> {
        let attempt = self.record(backend, method, params);
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak);

        match self.behaviours.get(method) {
            Some(MockBehaviour::ReturnValue(v)) => Ok(v.clone()),
            Some(MockBehaviour::Delayed(delay, v)) => {
                tokio::time::sleep(*delay).await;
                Ok(v.clone())
            }
            Some(MockBehaviour::FailRetryable(msg)) => Err(ProviderError::Executor(msg.clone())),
            Some(MockBehaviour::FailTimeout) => Err(ProviderError::Timeout(timeout)),
            Some(MockBehaviour::Reject(msg)) => Err(ProviderError::Rejected(msg.clone())),
            Some(MockBehaviour::FailThenReturn { failures, value }) => {
                if attempt <= *failures {
                    Err(ProviderError::Executor(format!("scripted failure #{attempt}")))
                } else {
                    Ok(value.clone())
                }
            }
            Some(MockBehaviour::Panic(msg)) => panic!("{msg}"),
            None => Err(ProviderError::Rejected(format!("no behaviour scripted for '{method}'"))),
        }
    }

    async fn health_check(&self, backend: &BackendDescriptor) -> bool {
        !self.unhealthy.contains(&backend.endpoint)
    }
}

/// Counts one call as in flight until dropped, even when the call's
/// future is cancelled mid-await.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A cache whose every operation fails.
#[derive(Debug, Default)]
pub struct FailingCache;

#[async_trait]
impl CacheStore for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<Value>, CacheError> {
        Err(CacheError::Unavailable("cache is down".into()))
    }

    async fn set(&self, _key: &str, _value: Value) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("cache is down".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> BackendDescriptor {
        BackendDescriptor::new("search", "es-1")
    }

    #[tokio::test]
    async fn fail_then_return_recovers_after_scripted_failures() {
        let exec = MockExecutor::new().on(
            "query",
            MockBehaviour::FailThenReturn { failures: 2, value: json!("ok") },
        );
        let params = json!({});
        let t = Duration::from_secs(1);

        assert!(exec.call(&backend(), "query", &params, t).await.is_err());
        assert!(exec.call(&backend(), "query", &params, t).await.is_err());
        assert_eq!(exec.call(&backend(), "query", &params, t).await, Ok(json!("ok")));
        assert_eq!(exec.calls_for("query"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_leaves_flight() {
        let exec = MockExecutor::new()
            .on("slow", MockBehaviour::Delayed(Duration::from_secs(1), json!(1)))
            .on("fast", MockBehaviour::ReturnValue(json!(2)));
        let params = json!({});
        let t = Duration::from_secs(5);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), exec.call(&backend(), "slow", &params, t)).await;
        assert!(cancelled.is_err());

        assert_eq!(exec.call(&backend(), "fast", &params, t).await, Ok(json!(2)));
        assert_eq!(exec.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn unscripted_method_is_rejected() {
        let exec = MockExecutor::new();
        let err = exec
            .call(&backend(), "nope", &json!(null), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(exec.call_count(), 1);
    }

    #[tokio::test]
    async fn unhealthy_endpoint_fails_probe() {
        let exec = MockExecutor::new().with_unhealthy("es-1");
        assert!(!exec.health_check(&backend()).await);
        assert!(exec.health_check(&BackendDescriptor::new("search", "es-2")).await);
    }
}
