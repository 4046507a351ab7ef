//! Plan execution engine.
//!
//! `Orchestrator` is the central coordinator:
//! 1. Walks `plan.execution_order` one level at a time.
//! 2. Spawns every pending node of a level into a `JoinSet`, each task first
//!    taking a permit from one plan-wide semaphore.
//! 3. Waits for the whole level, then marks every descendant of a failed node
//!    as skipped.
//! 4. Serves cached results, retries transient backend failures with
//!    exponential back-off and writes successful results through to the cache.
//!
//! Node failures never abort the plan; the returned `ExecutionResult` always
//! describes every node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use providers::{CacheStore, CapabilityExecutor, ProviderError};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::handlers::{self, DependencyOutcome, Outcomes};
use crate::models::{
    CallParams, ExecutionResult, Node, NodeKind, NodeStatus, Plan, PlanStatus,
};
use crate::monitor::{
    EngineMetrics, HealthReport, HealthStatus, PlanStatusSnapshot, RunTally, StatusBoard,
};
use crate::registry::{CapabilityRegistry, RegisteredBackend};
use crate::EngineError;

type ActivePlans = Arc<RwLock<HashMap<String, Arc<StatusBoard>>>>;

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Executes plans against a registry, an executor and a cache.
///
/// Owns no global state: build one per process, or one per test.
pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    executor: Arc<dyn CapabilityExecutor>,
    cache: Arc<dyn CacheStore>,
    config: Arc<OrchestratorConfig>,
    active: ActivePlans,
    metrics: Arc<EngineMetrics>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        executor: Arc<dyn CapabilityExecutor>,
        cache: Arc<dyn CacheStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            cache,
            config: Arc::new(config),
            active: ActivePlans::default(),
            metrics: Arc::new(EngineMetrics::default()),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run `plan` to completion and report what happened.
    ///
    /// Never fails for node-level problems: failed and skipped nodes are
    /// described in the result and the overall status becomes `Failed`.
    #[instrument(skip_all, fields(plan_id = %plan.id, context = %plan.context))]
    pub async fn execute_plan(&self, mut plan: Plan) -> ExecutionResult {
        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        info!(
            %execution_id,
            nodes = plan.len(),
            levels = plan.execution_order.len(),
            "executing plan '{}'", plan.name
        );

        let board = Arc::new(StatusBoard::new(&plan));
        let _tracking = ActiveGuard::track(&self.active, &plan.id, Arc::clone(&board));

        let counters = Arc::new(CacheCounters::default());
        let runner = NodeRunner {
            registry: Arc::clone(&self.registry),
            executor: Arc::clone(&self.executor),
            cache: Arc::clone(&self.cache),
            config: Arc::clone(&self.config),
            board: Arc::clone(&board),
            counters: Arc::clone(&counters),
        };
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_nodes.clamp(1, Semaphore::MAX_PERMITS),
        ));

        let mut nodes = std::mem::take(&mut plan.nodes);
        let mut outcomes = Outcomes::new();
        let mut errors: IndexMap<String, String> = IndexMap::new();

        for (index, level) in plan.execution_order.iter().enumerate() {
            // ------------------------------------------------------------------
            // Launch every node of the level that is still pending.
            // ------------------------------------------------------------------
            let mut batch: Vec<Node> = level
                .iter()
                .filter_map(|id| nodes.get(id))
                .filter(|node| node.status == NodeStatus::Pending)
                .cloned()
                .collect();
            batch.sort_by_key(|node| std::cmp::Reverse(node.priority));

            debug!(level = index, launched = batch.len(), of = level.len(), "starting level");

            let mut join_set = JoinSet::new();
            for node in batch {
                let inputs = dependency_inputs(&node, &outcomes);
                join_set.spawn(runner.clone().run(node, Arc::clone(&semaphore), inputs));
            }

            // ------------------------------------------------------------------
            // Wait for all of them.
            // ------------------------------------------------------------------
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(node) => {
                        outcomes.insert(
                            node.id.clone(),
                            DependencyOutcome { status: node.status, result: node.result.clone() },
                        );
                        if let (NodeStatus::Failed, Some(message)) = (node.status, &node.error) {
                            errors.insert(node.id.clone(), message.clone());
                        }
                        nodes.insert(node.id.clone(), node);
                    }
                    Err(join_err) => {
                        error!(%join_err, "node task did not finish");
                        errors.insert(
                            ExecutionResult::ORCHESTRATOR_KEY.to_owned(),
                            format!("node task aborted: {join_err}"),
                        );
                    }
                }
            }

            // A task that panicked never handed its node back.
            for id in level {
                let Some(node) = nodes.get_mut(id) else { continue };
                if node.status == NodeStatus::Pending {
                    let message = "node task aborted before reaching a terminal state".to_owned();
                    node.status = NodeStatus::Failed;
                    node.error = Some(message.clone());
                    node.finished_at = Some(Utc::now());
                    board.publish(node.snapshot());
                    outcomes.insert(id.clone(), DependencyOutcome::with_status(NodeStatus::Failed));
                    errors.insert(id.clone(), message);
                }
            }

            // ------------------------------------------------------------------
            // Skip everything downstream of a failure.
            // ------------------------------------------------------------------
            let failed: Vec<&String> = level
                .iter()
                .filter(|id| nodes.get(*id).is_some_and(|n| n.status == NodeStatus::Failed))
                .collect();

            for failed_id in failed {
                for descendant in plan.descendants(failed_id) {
                    let Some(node) = nodes.get_mut(&descendant) else { continue };
                    if node.status != NodeStatus::Pending {
                        continue;
                    }
                    let reason = format!("skipped: upstream node '{failed_id}' failed");
                    warn!(node_id = %descendant, failed = %failed_id, "skipping node");
                    node.status = NodeStatus::Skipped;
                    node.error = Some(reason.clone());
                    board.publish(node.snapshot());
                    outcomes.insert(descendant.clone(), DependencyOutcome::with_status(NodeStatus::Skipped));
                    errors.insert(descendant, reason);
                }
            }
        }

        // ------------------------------------------------------------------
        // Aggregate.
        // ------------------------------------------------------------------
        let count = |status: NodeStatus| nodes.values().filter(|n| n.status == status).count();
        let nodes_executed = count(NodeStatus::Completed);
        let nodes_failed = count(NodeStatus::Failed);
        let nodes_skipped = count(NodeStatus::Skipped);

        let status = if nodes_failed == 0 && !errors.contains_key(ExecutionResult::ORCHESTRATOR_KEY) {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };

        let results = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Completed)
            .filter_map(|n| n.result.clone().map(|r| (n.id.clone(), r)))
            .collect();

        let cache_hits = counters.hits.load(Ordering::Relaxed);
        let cache_misses = counters.misses.load(Ordering::Relaxed);
        self.metrics.record(RunTally {
            failed: status == PlanStatus::Failed,
            nodes_executed,
            nodes_failed,
            nodes_skipped,
            cache_hits,
            cache_misses,
        });

        let duration = clock.elapsed();
        match status {
            PlanStatus::Completed => info!(nodes_executed, ?duration, "plan completed"),
            _ => warn!(nodes_executed, nodes_failed, nodes_skipped, ?duration, "plan failed"),
        }

        ExecutionResult {
            execution_id,
            plan_id: plan.id,
            status,
            results,
            errors,
            nodes: nodes.iter().map(|(id, n)| (id.clone(), n.snapshot())).collect(),
            nodes_executed,
            nodes_skipped,
            nodes_failed,
            cache_hits,
            cache_misses,
            started_at,
            finished_at: Utc::now(),
            duration,
        }
    }

    /// Snapshot of a plan that is currently executing.
    pub fn get_execution_status(&self, plan_id: &str) -> Option<PlanStatusSnapshot> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plan_id)
            .map(|board| board.snapshot())
    }

    pub fn active_plans(&self) -> usize {
        self.active.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Re-probe every backend and report engine health.
    pub async fn health_check(&self) -> HealthReport {
        let healthy = self.registry.health_check_all(self.executor.as_ref()).await;
        let backends = self.registry.snapshot();
        let total: usize = backends.values().map(Vec::len).sum();

        HealthReport {
            status: if healthy == total { HealthStatus::Healthy } else { HealthStatus::Degraded },
            backends,
            active_plans: self.active_plans(),
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Outcomes of `node`'s own dependencies, the only ones its handler reads.
pub(crate) fn dependency_inputs(node: &Node, outcomes: &Outcomes) -> Outcomes {
    node.dependencies
        .iter()
        .filter_map(|dep| outcomes.get(dep).map(|outcome| (dep.clone(), outcome.clone())))
        .collect()
}

// ---------------------------------------------------------------------------
// Active-plan tracking
// ---------------------------------------------------------------------------

/// Keeps a plan visible to `get_execution_status` for as long as it runs.
struct ActiveGuard {
    active: ActivePlans,
    plan_id: String,
}

impl ActiveGuard {
    fn track(active: &ActivePlans, plan_id: &str, board: Arc<StatusBoard>) -> Self {
        active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan_id.to_owned(), board);
        Self { active: Arc::clone(active), plan_id: plan_id.to_owned() }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.plan_id);
    }
}

// ---------------------------------------------------------------------------
// Per-node execution
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Everything a node task needs, cloned into each spawned task.
#[derive(Clone)]
struct NodeRunner {
    registry: Arc<CapabilityRegistry>,
    executor: Arc<dyn CapabilityExecutor>,
    cache: Arc<dyn CacheStore>,
    config: Arc<OrchestratorConfig>,
    board: Arc<StatusBoard>,
    counters: Arc<CacheCounters>,
}

impl NodeRunner {
    /// Take a global slot, execute the node and hand it back terminal.
    async fn run(self, mut node: Node, slots: Arc<Semaphore>, outcomes: Outcomes) -> Node {
        let _permit = slots.acquire_owned().await;
        self.execute_node(&mut node, &outcomes).await;
        node
    }

    async fn execute_node(&self, node: &mut Node, outcomes: &Outcomes) {
        node.started_at = Some(Utc::now());
        self.transition(node, NodeStatus::Running);
        debug!(node_id = %node.id, kind = node.kind.label(), "node started");

        let outcome = match self.cached(node).await {
            Some(value) => Ok(value),
            None => {
                let computed = self.dispatch(node, outcomes).await;
                if let (Ok(value), Some(key)) = (&computed, &node.cache_key) {
                    if let Err(e) = self.cache.set(key, value.clone()).await {
                        warn!(node_id = %node.id, %key, error = %e, "cache write failed");
                    }
                }
                computed
            }
        };

        node.finished_at = Some(Utc::now());
        match outcome {
            Ok(value) => {
                node.result = Some(value);
                self.transition(node, NodeStatus::Completed);
                info!(node_id = %node.id, retries = node.retry_count, "node completed");
            }
            Err(err) => {
                error!(node_id = %node.id, error = %err, "node failed");
                node.error = Some(err.to_string());
                self.transition(node, NodeStatus::Failed);
            }
        }
    }

    fn transition(&self, node: &mut Node, status: NodeStatus) {
        node.status = status;
        self.board.publish(node.snapshot());
    }

    /// Cached value for the node's key; lookup errors count as misses.
    async fn cached(&self, node: &Node) -> Option<Value> {
        let key = node.cache_key.as_deref()?;
        match self.cache.get(key).await {
            Ok(Some(value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(node_id = %node.id, key, "cache hit");
                Some(value)
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                warn!(node_id = %node.id, key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn dispatch(&self, node: &mut Node, outcomes: &Outcomes) -> Result<Value, EngineError> {
        match node.kind.clone() {
            NodeKind::ExternalCall(call) => self.call_with_retry(node, &call).await,
            NodeKind::Aggregation(params) => {
                Ok(handlers::aggregate(&params, &node.dependencies, outcomes))
            }
            NodeKind::Conditional(params) => {
                handlers::evaluate_condition(&node.id, &params, &node.dependencies, outcomes)
            }
            NodeKind::Transformation(params) => {
                handlers::transform(&node.id, &params, &node.dependencies, outcomes)
            }
        }
    }

    // -----------------------------------------------------------------------
    // External calls with retry.
    // -----------------------------------------------------------------------

    async fn call_with_retry(&self, node: &mut Node, call: &CallParams) -> Result<Value, EngineError> {
        let backend = self
            .registry
            .resolve(&call.category, &call.method)
            .ok_or_else(|| EngineError::BackendUnavailable {
                category: call.category.clone(),
                method: call.method.clone(),
            })?;

        let descriptor = backend.descriptor();
        let timeout = node
            .timeout_ms
            .map(Duration::from_millis)
            .or_else(|| descriptor.timeout())
            .unwrap_or_else(|| self.config.default_timeout());
        let max_retries = node
            .max_retries
            .or(descriptor.max_retries)
            .unwrap_or(Node::DEFAULT_MAX_RETRIES);

        loop {
            let err = match self.attempt(&node.id, &backend, call, timeout).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if node.retry_count >= max_retries {
                return Err(EngineError::RetryExhausted {
                    node_id: node.id.clone(),
                    attempts: node.retry_count + 1,
                    message: err.to_string(),
                });
            }

            node.retry_count += 1;
            let delay = self.config.backoff_delay(node.retry_count);
            warn!(
                node_id = %node.id,
                attempt = node.retry_count,
                max_retries,
                ?delay,
                error = %err,
                "transient failure, retrying"
            );
            self.transition(node, NodeStatus::Retrying);
            tokio::time::sleep(delay).await;
            self.transition(node, NodeStatus::Running);
        }
    }

    /// One bounded attempt against `backend`.
    async fn attempt(
        &self,
        node_id: &str,
        backend: &RegisteredBackend,
        call: &CallParams,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let descriptor = backend.descriptor();
        let _slot = backend.acquire().await.map_err(|_| EngineError::BackendUnavailable {
            category: call.category.clone(),
            method: call.method.clone(),
        })?;

        let timed_out = || EngineError::Timeout {
            node_id: node_id.to_owned(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };

        let invocation = self.executor.call(descriptor, &call.method, &call.params, timeout);
        match tokio::time::timeout(timeout, invocation).await {
            Err(_) | Ok(Err(ProviderError::Timeout(_))) => Err(timed_out()),
            Ok(Err(source)) => Err(EngineError::Executor { node_id: node_id.to_owned(), source }),
            Ok(Ok(value)) => Ok(value),
        }
    }
}
