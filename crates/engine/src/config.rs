//! Orchestrator tuning knobs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the orchestrator.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Global cap on nodes running at once across a whole plan.
    pub max_concurrent_nodes: usize,
    /// Exponent base for retry back-off. Must be finite and greater than 1.0
    /// so that successive delays strictly grow.
    pub retry_backoff_base: f64,
    /// Back-off unit; attempt `n` waits `unit * base^n`.
    pub retry_backoff_unit_ms: u64,
    /// Per-attempt timeout when neither the node nor its backend set one.
    pub default_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 10,
            retry_backoff_base: 2.0,
            retry_backoff_unit_ms: 1_000,
            default_timeout_ms: 30_000,
        }
    }
}

/// Failure to load an [`OrchestratorConfig`] from disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

impl OrchestratorConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make back-off delays stop growing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.retry_backoff_base;
        if !base.is_finite() || base <= 1.0 {
            return Err(ConfigError::Invalid {
                field: "retry_backoff_base",
                message: format!("must be a finite number greater than 1.0, got {base}"),
            });
        }
        Ok(())
    }

    /// Delay before retry number `retry_count` (1-based).
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let factor = self.retry_backoff_base.powi(exponent);
        let unit = Duration::from_millis(self.retry_backoff_unit_ms);
        Duration::try_from_secs_f64(unit.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
