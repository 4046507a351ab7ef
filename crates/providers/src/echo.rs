//! `EchoExecutor`: a dry-run executor that performs no I/O.
//!
//! Used by the CLI's `run` command to show what a plan would dispatch.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{BackendDescriptor, CapabilityExecutor, ProviderError};

/// Answers every call with a record of the call itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

#[async_trait]
impl CapabilityExecutor for EchoExecutor {
    async fn call(
        &self,
        backend: &BackendDescriptor,
        method: &str,
        params: &Value,
        _timeout: Duration,
    ) -> Result<Value, ProviderError> {
        debug!(endpoint = %backend.endpoint, method, "echoing capability call");
        Ok(json!({
            "category": backend.category,
            "endpoint": backend.endpoint,
            "method": method,
            "params": params,
        }))
    }
}
