//! `engine` crate: plan model, graph builder, capability registry and the
//! level-by-level orchestrator.

pub mod models;
pub mod error;
pub mod config;
pub mod dag;
pub mod registry;
pub mod handlers;
pub mod monitor;
pub mod executor;

pub use models::{
    AggregateFunction, ExecutionResult, Node, NodeKind, NodeStatus, Plan, PlanDefinition,
    PlanStatus, TransformKind,
};
pub use error::EngineError;
pub use config::OrchestratorConfig;
pub use dag::PlanBuilder;
pub use registry::CapabilityRegistry;
pub use monitor::{HealthReport, HealthStatus, PlanStatusSnapshot};
pub use executor::Orchestrator;
