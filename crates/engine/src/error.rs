//! Engine-level error types.

use providers::ProviderError;
use thiserror::Error;

/// Errors produced by the engine (plan construction + node execution).
///
/// Build-time variants are returned from [`PlanBuilder::build`](crate::PlanBuilder::build);
/// the rest are captured per node and surface as messages in
/// [`ExecutionResult::errors`](crate::ExecutionResult).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    // ------ Build errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// A node depends on an ID that doesn't exist in the plan.
    #[error("node '{node_id}' depends on unknown node '{dependency}'")]
    DanglingDependency {
        node_id: String,
        dependency: String,
    },

    /// Leveling stalled with nodes left over.
    #[error("plan graph contains a cycle involving {remaining:?}")]
    CycleDetected {
        remaining: Vec<String>,
    },

    // ------ Execution errors ------

    /// No healthy backend is registered for the requested capability.
    #[error("no healthy backend for capability '{category}' (method '{method}')")]
    BackendUnavailable {
        category: String,
        method: String,
    },

    /// A single attempt exceeded its timeout.
    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout {
        node_id: String,
        timeout_ms: u64,
    },

    /// The executor reported a failure.
    #[error("node '{node_id}' executor error: {source}")]
    Executor {
        node_id: String,
        source: ProviderError,
    },

    /// A transient error persisted through every retry.
    #[error("node '{node_id}' failed after {attempts} attempts: {message}")]
    RetryExhausted {
        node_id: String,
        attempts: u32,
        message: String,
    },

    /// Malformed aggregation, conditional or transformation configuration.
    #[error("node '{node_id}' is misconfigured: {message}")]
    Validation {
        node_id: String,
        message: String,
    },
}

impl EngineError {
    /// Whether the failure may clear up on another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Executor { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
