//! Core domain models for the execution engine.
//!
//! `Node` and `Plan` are the in-memory shape of a unit of work and a built
//! graph; `ExecutionResult` is what a finished run hands back.  The
//! `*Definition` types are the serialised form accepted from files.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// What a node does when it runs.  Each variant carries only its own config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Invoke a method on a backend resolved through the registry.
    ExternalCall(CallParams),
    /// Fold the results of completed dependencies.
    Aggregation(AggregationParams),
    /// Record a branch decision over dependency outcomes.
    Conditional(ConditionalParams),
    /// Reshape the results of completed dependencies.
    Transformation(TransformParams),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ExternalCall(_) => "external_call",
            Self::Aggregation(_) => "aggregation",
            Self::Conditional(_) => "conditional",
            Self::Transformation(_) => "transformation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallParams {
    /// Capability category, e.g. `"search"`.
    pub category: String,
    pub method: String,
    /// Passed to the executor untouched.
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    /// Shallow object merge; later dependencies win on key conflicts.
    Merge,
    /// Results in dependency declaration order.
    List,
    /// Number of completed dependencies.
    Count,
    /// Arithmetic sum of numeric results.
    Sum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationParams {
    pub function: AggregateFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalParams {
    /// `true`, `false` or `has_result:<dep_id>`.
    pub condition: String,
    #[serde(default)]
    pub true_branch: Vec<String>,
    #[serde(default)]
    pub false_branch: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Flatten,
    ExtractKeys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformParams {
    pub transform: TransformKind,
    /// Key subset for `extract_keys`; ignored by `flatten`.
    #[serde(default)]
    pub keys: Vec<String>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Lifecycle of a node within one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A single unit of work in a plan.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    /// Unique identifier within the plan (referenced by dependencies).
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Upstream node IDs in declaration order, without duplicates.
    pub dependencies: Vec<String>,
    pub status: NodeStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Retries performed so far (the first attempt is not a retry).
    pub retry_count: u32,
    /// Retry budget; falls back to the backend's, then `DEFAULT_MAX_RETRIES`.
    pub max_retries: Option<u32>,
    /// Per-attempt timeout; falls back to the backend's, then the engine's.
    pub timeout_ms: Option<u64>,
    pub cache_key: Option<String>,
    /// Higher values are queued first within a level.
    pub priority: i32,
}

impl Node {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            dependencies: Vec::new(),
            status: NodeStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            max_retries: None,
            timeout_ms: None,
            cache_key: None,
            priority: 0,
        }
    }

    pub fn call(
        id: impl Into<String>,
        category: impl Into<String>,
        method: impl Into<String>,
        params: Value,
    ) -> Self {
        Self::new(
            id,
            NodeKind::ExternalCall(CallParams {
                category: category.into(),
                method: method.into(),
                params,
            }),
        )
    }

    pub fn aggregation(id: impl Into<String>, function: AggregateFunction) -> Self {
        Self::new(id, NodeKind::Aggregation(AggregationParams { function }))
    }

    pub fn conditional(
        id: impl Into<String>,
        condition: impl Into<String>,
        true_branch: Vec<String>,
        false_branch: Vec<String>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::Conditional(ConditionalParams {
                condition: condition.into(),
                true_branch,
                false_branch,
            }),
        )
    }

    pub fn transformation(id: impl Into<String>, transform: TransformKind, keys: Vec<String>) -> Self {
        Self::new(id, NodeKind::Transformation(TransformParams { transform, keys }))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append dependencies, keeping declaration order and dropping repeats.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            retry_count: self.retry_count,
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a node's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A validated graph ready for execution.
///
/// Only [`PlanBuilder::build`](crate::PlanBuilder::build) produces plans, so
/// every `Plan` is acyclic and its `execution_order` is a valid leveling.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Tenant/domain tag carried into logs.
    pub context: String,
    /// Nodes in insertion order.
    pub nodes: IndexMap<String, Node>,
    /// Levels; every dependency of a node sits in a strictly earlier level.
    pub execution_order: Vec<Vec<String>>,
    /// Reverse edges over the full graph: node -> direct dependents.
    #[serde(skip)]
    pub(crate) dependents: IndexMap<String, Vec<String>>,
}

impl Plan {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node that transitively depends on `id`, nearest first.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(children) = self.dependents.get(current) else {
                continue;
            };
            for child in children {
                if seen.insert(child.as_str()) {
                    out.push(child.clone());
                    queue.push_back(child.as_str());
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Running,
    Completed,
    Failed,
}

/// Everything a finished plan execution produced.
///
/// `status` is `Failed` as soon as one node failed, but `results` still holds
/// every node that did complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// ID of this particular run.
    pub execution_id: Uuid,
    pub plan_id: String,
    pub status: PlanStatus,
    pub results: IndexMap<String, Value>,
    /// Failure messages and skip reasons keyed by node ID; the
    /// `"orchestrator"` key is reserved for engine defects.
    pub errors: IndexMap<String, String>,
    /// Final state of every node in plan order.
    pub nodes: IndexMap<String, NodeSnapshot>,
    pub nodes_executed: usize,
    pub nodes_skipped: usize,
    pub nodes_failed: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub const ORCHESTRATOR_KEY: &'static str = "orchestrator";

    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Completed
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|n| n.status)
    }
}

// ---------------------------------------------------------------------------
// Definitions (file format)
// ---------------------------------------------------------------------------

/// Serialised node accepted from plan files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

impl From<NodeDefinition> for Node {
    fn from(def: NodeDefinition) -> Self {
        let mut node = Node::new(def.id, def.kind).depends_on(def.dependencies);
        if let Some(name) = def.name {
            node.name = name;
        }
        node.max_retries = def.max_retries;
        node.timeout_ms = def.timeout_ms;
        node.cache_key = def.cache_key;
        node.priority = def.priority;
        node
    }
}

/// Serialised plan accepted from plan files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub context: String,
    pub nodes: Vec<NodeDefinition>,
}
