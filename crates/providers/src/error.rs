//! Provider-level error types.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`CapabilityExecutor`](crate::CapabilityExecutor) call.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Timeout` / `Executor`: transient, retried with exponential back-off.
/// - `Rejected`: permanent, the node fails immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The attempt did not finish within its per-attempt timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Transient failure reported by the backend.
    #[error("executor error: {0}")]
    Executor(String),

    /// The backend refused the request; retrying will not help.
    #[error("rejected by provider: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Errors returned by a [`CacheStore`](crate::CacheStore).
///
/// Never fatal to a node: the engine treats a failed lookup as a miss and a
/// failed write as a no-op.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejections_are_permanent() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ProviderError::Executor("502".into()).is_retryable());
        assert!(!ProviderError::Rejected("bad query".into()).is_retryable());
    }
}
