//! `capflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` : check a plan file and print its execution levels.
//! - `run`      : execute a plan against echo backends and print the result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::{CapabilityRegistry, Orchestrator, OrchestratorConfig, Plan, PlanBuilder, PlanDefinition};
use providers::{BackendDescriptor, EchoExecutor, MemoryCache};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "capflow", about = "Dependency-ordered capability plan runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a plan definition JSON file.
    Validate {
        /// Path to the plan JSON file.
        path: PathBuf,
    },
    /// Execute a plan definition JSON file.
    Run {
        /// Path to the plan JSON file.
        path: PathBuf,
        /// JSON list of backend descriptors to register.
        #[arg(long)]
        backends: Option<PathBuf>,
        /// Orchestrator configuration JSON.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, env = "CAPFLOW_MAX_CONCURRENT_NODES")]
        max_concurrent_nodes: Option<usize>,
    },
}

/// One entry of the `--backends` file.
#[derive(Debug, Deserialize)]
struct BackendEntry {
    #[serde(flatten)]
    descriptor: BackendDescriptor,
    #[serde(default = "default_healthy")]
    healthy: bool,
}

fn default_healthy() -> bool {
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let plan = load_plan(&path)?;
            println!("Plan '{}' is valid ({} nodes).", plan.name, plan.len());
            for (index, level) in plan.execution_order.iter().enumerate() {
                println!("  level {index}: {}", level.join(", "));
            }
        }
        Command::Run { path, backends, config, max_concurrent_nodes } => {
            let mut config = match config {
                Some(file) => OrchestratorConfig::from_file(&file)
                    .with_context(|| format!("cannot load config {}", file.display()))?,
                None => OrchestratorConfig::default(),
            };
            if let Some(limit) = max_concurrent_nodes {
                config.max_concurrent_nodes = limit;
            }

            let registry = Arc::new(CapabilityRegistry::new());
            if let Some(file) = backends {
                for entry in load_backends(&file)? {
                    let (category, endpoint) =
                        (entry.descriptor.category.clone(), entry.descriptor.endpoint.clone());
                    registry.register(entry.descriptor);
                    if !entry.healthy {
                        warn!(%category, %endpoint, "backend registered as unhealthy");
                        registry.set_healthy(&category, &endpoint, false);
                    }
                }
            }

            let plan = load_plan(&path)?;
            info!(plan_id = %plan.id, nodes = plan.len(), "running plan");

            let orchestrator = Orchestrator::new(
                registry,
                Arc::new(EchoExecutor),
                Arc::new(MemoryCache::new()),
                config,
            );
            let result = orchestrator.execute_plan(plan).await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_plan(path: &Path) -> Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read plan file {}", path.display()))?;
    let definition: PlanDefinition =
        serde_json::from_str(&content).context("plan file is not a valid plan definition")?;

    let id = definition.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (name, context) = (definition.name.clone(), definition.context.clone());
    let plan = PlanBuilder::from_definition(definition)
        .build(id, name, context)
        .context("plan graph is invalid")?;
    Ok(plan)
}

fn load_backends(path: &Path) -> Result<Vec<BackendEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read backends file {}", path.display()))?;
    serde_json::from_str(&content).context("backends file is not a list of backend descriptors")
}
