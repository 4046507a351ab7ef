//! Observability surface: live plan status, engine counters and health.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::models::{NodeSnapshot, Plan, PlanStatus};
use crate::registry::BackendHealth;

/// Live per-node state of one running plan.
///
/// Node tasks publish every transition here; readers only ever get copies.
#[derive(Debug)]
pub struct StatusBoard {
    plan_id: String,
    started_at: DateTime<Utc>,
    nodes: Mutex<IndexMap<String, NodeSnapshot>>,
}

impl StatusBoard {
    pub fn new(plan: &Plan) -> Self {
        Self {
            plan_id: plan.id.clone(),
            started_at: Utc::now(),
            nodes: Mutex::new(
                plan.nodes
                    .values()
                    .map(|node| (node.id.clone(), node.snapshot()))
                    .collect(),
            ),
        }
    }

    pub fn publish(&self, snapshot: NodeSnapshot) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn snapshot(&self) -> PlanStatusSnapshot {
        PlanStatusSnapshot {
            plan_id: self.plan_id.clone(),
            status: PlanStatus::Running,
            started_at: self.started_at,
            nodes: self
                .nodes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Answer to `get_execution_status`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStatusSnapshot {
    pub plan_id: String,
    pub status: PlanStatus,
    pub started_at: DateTime<Utc>,
    pub nodes: IndexMap<String, NodeSnapshot>,
}

/// Cumulative counters across every plan an orchestrator has run.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    plans_executed: AtomicU64,
    plans_failed: AtomicU64,
    nodes_executed: AtomicU64,
    nodes_failed: AtomicU64,
    nodes_skipped: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Per-run tallies folded into [`EngineMetrics`] when a plan finishes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunTally {
    pub failed: bool,
    pub nodes_executed: usize,
    pub nodes_failed: usize,
    pub nodes_skipped: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

fn widen(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

impl EngineMetrics {
    pub fn record(&self, tally: RunTally) {
        self.plans_executed.fetch_add(1, Ordering::Relaxed);
        if tally.failed {
            self.plans_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.nodes_executed.fetch_add(widen(tally.nodes_executed), Ordering::Relaxed);
        self.nodes_failed.fetch_add(widen(tally.nodes_failed), Ordering::Relaxed);
        self.nodes_skipped.fetch_add(widen(tally.nodes_skipped), Ordering::Relaxed);
        self.cache_hits.fetch_add(tally.cache_hits, Ordering::Relaxed);
        self.cache_misses.fetch_add(tally.cache_misses, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            plans_executed: self.plans_executed.load(Ordering::Relaxed),
            plans_failed: self.plans_failed.load(Ordering::Relaxed),
            nodes_executed: self.nodes_executed.load(Ordering::Relaxed),
            nodes_failed: self.nodes_failed.load(Ordering::Relaxed),
            nodes_skipped: self.nodes_skipped.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub plans_executed: u64,
    pub plans_failed: u64,
    pub nodes_executed: u64,
    pub nodes_failed: u64,
    pub nodes_skipped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Answer to `health_check`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backends: IndexMap<String, Vec<BackendHealth>>,
    pub active_plans: usize,
    pub metrics: MetricsSnapshot,
}
