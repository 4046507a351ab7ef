//! Plan construction: accumulate nodes, validate the graph and compute levels.
//!
//! Rules enforced by [`PlanBuilder::build`]:
//! 1. Node IDs must be unique within the plan.
//! 2. Every dependency must reference a node in the same plan.
//! 3. The directed graph must be acyclic.
//!
//! On success the plan carries its level partition (`execution_order`) and a
//! reverse-edge index used for skip propagation.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::models::{AggregateFunction, Node, Plan, PlanDefinition, TransformKind};
use crate::EngineError;

/// Incrementally accumulates nodes; consumed by [`PlanBuilder::build`].
#[derive(Debug, Default)]
pub struct PlanBuilder {
    nodes: Vec<Node>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a builder from a serialised plan definition.
    pub fn from_definition(definition: PlanDefinition) -> Self {
        definition
            .nodes
            .into_iter()
            .fold(Self::new(), |builder, def| builder.add_node(def.into()))
    }

    /// Append a fully configured node.
    pub fn add_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_call_node(
        self,
        id: &str,
        category: &str,
        method: &str,
        params: Value,
        dependencies: &[&str],
    ) -> Self {
        self.add_node(Node::call(id, category, method, params).depends_on(dependencies.iter().copied()))
    }

    pub fn add_aggregation_node(
        self,
        id: &str,
        function: AggregateFunction,
        dependencies: &[&str],
    ) -> Self {
        self.add_node(Node::aggregation(id, function).depends_on(dependencies.iter().copied()))
    }

    pub fn add_conditional_node(
        self,
        id: &str,
        condition: &str,
        dependencies: &[&str],
        true_branch: &[&str],
        false_branch: &[&str],
    ) -> Self {
        let owned = |ids: &[&str]| -> Vec<String> { ids.iter().map(|s| (*s).to_owned()).collect() };
        self.add_node(
            Node::conditional(id, condition, owned(true_branch), owned(false_branch))
                .depends_on(dependencies.iter().copied()),
        )
    }

    pub fn add_transform_node(
        self,
        id: &str,
        transform: TransformKind,
        keys: &[&str],
        dependencies: &[&str],
    ) -> Self {
        let keys = keys.iter().map(|k| (*k).to_owned()).collect();
        self.add_node(Node::transformation(id, transform, keys).depends_on(dependencies.iter().copied()))
    }

    /// Validate the graph and produce an executable [`Plan`].
    ///
    /// # Errors
    /// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`EngineError::DanglingDependency`] if a dependency is missing.
    /// - [`EngineError::CycleDetected`] if the graph is not acyclic.
    pub fn build(
        self,
        plan_id: impl Into<String>,
        name: impl Into<String>,
        context: impl Into<String>,
    ) -> Result<Plan, EngineError> {
        // -------------------------------------------------------------------
        // 1. Ensure node IDs are unique
        // -------------------------------------------------------------------
        let mut nodes: IndexMap<String, Node> = IndexMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(EngineError::DuplicateNodeId(node.id));
            }
            nodes.insert(node.id.clone(), node);
        }

        // -------------------------------------------------------------------
        // 2. Validate dependency references, collect reverse edges
        // -------------------------------------------------------------------
        let mut dependents: IndexMap<String, Vec<String>> =
            nodes.keys().map(|id| (id.clone(), Vec::new())).collect();

        for node in nodes.values() {
            for dep in &node.dependencies {
                let Some(children) = dependents.get_mut(dep) else {
                    return Err(EngineError::DanglingDependency {
                        node_id: node.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                children.push(node.id.clone());
            }
        }

        // -------------------------------------------------------------------
        // 3. Level by frontier removal (Kahn)
        // -------------------------------------------------------------------
        let execution_order = compute_levels(&nodes)?;

        let plan = Plan {
            id: plan_id.into(),
            name: name.into(),
            context: context.into(),
            nodes,
            execution_order,
            dependents,
        };
        debug!(
            plan_id = %plan.id,
            nodes = plan.len(),
            levels = plan.execution_order.len(),
            "plan built"
        );
        Ok(plan)
    }
}

/// Partition `nodes` into levels.
///
/// Each round takes every unscheduled node whose dependencies are all
/// scheduled, in insertion order.  A round that schedules nothing while nodes
/// remain means the rest of the graph is cyclic.
fn compute_levels(nodes: &IndexMap<String, Node>) -> Result<Vec<Vec<String>>, EngineError> {
    let mut scheduled: HashSet<&str> = HashSet::with_capacity(nodes.len());
    let mut remaining: Vec<&Node> = nodes.values().collect();
    let mut levels: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Node>, Vec<&Node>) = remaining
            .into_iter()
            .partition(|n| n.dependencies.iter().all(|d| scheduled.contains(d.as_str())));

        if ready.is_empty() {
            return Err(EngineError::CycleDetected {
                remaining: blocked.iter().map(|n| n.id.clone()).collect(),
            });
        }

        scheduled.extend(ready.iter().map(|n| n.id.as_str()));
        levels.push(ready.iter().map(|n| n.id.clone()).collect());
        remaining = blocked;
    }

    Ok(levels)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn call(builder: PlanBuilder, id: &str, deps: &[&str]) -> PlanBuilder {
        builder.add_call_node(id, "search", "query", json!({}), deps)
    }

    #[test]
    fn linear_chain_gets_one_node_per_level() {
        // A → B → C
        let builder = call(call(call(PlanBuilder::new(), "a", &[]), "b", &["a"]), "c", &["b"]);
        let plan = builder.build("p1", "linear", "tests").expect("should be valid");
        assert_eq!(plan.execution_order, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_levels_keep_insertion_order() {
        //   A
        //  / \
        // C   B
        //  \ /
        //   D
        let builder = PlanBuilder::new()
            .add_call_node("a", "search", "query", json!({}), &[])
            .add_call_node("c", "search", "query", json!({}), &["a"])
            .add_call_node("b", "search", "query", json!({}), &["a"])
            .add_aggregation_node("d", AggregateFunction::List, &["b", "c"]);

        let plan = builder.build("p", "diamond", "").expect("should be valid");
        assert_eq!(plan.execution_order, vec![vec!["a"], vec!["c", "b"], vec!["d"]]);
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let builder = call(call(PlanBuilder::new(), "a", &[]), "a", &[]);
        assert!(matches!(
            builder.build("p", "dup", ""),
            Err(EngineError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn dependency_on_missing_node_is_rejected() {
        let builder = call(PlanBuilder::new(), "a", &["ghost"]);
        assert!(matches!(
            builder.build("p", "dangling", ""),
            Err(EngineError::DanglingDependency { node_id, dependency })
                if node_id == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn two_node_cycle_is_detected() {
        // A ⇄ B
        let builder = call(call(PlanBuilder::new(), "a", &["b"]), "b", &["a"]);
        match builder.build("p", "cycle", "") {
            Err(EngineError::CycleDetected { remaining }) => assert_eq!(remaining, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_behind_valid_prefix_is_detected() {
        // root → x → y → z → x
        let builder = call(
            call(call(call(PlanBuilder::new(), "root", &[]), "x", &["root", "z"]), "y", &["x"]),
            "z",
            &["y"],
        );
        assert!(matches!(
            builder.build("p", "cycle", ""),
            Err(EngineError::CycleDetected { remaining }) if remaining.len() == 3
        ));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let builder = call(PlanBuilder::new(), "solo", &["solo"]);
        assert!(matches!(builder.build("p", "self", ""), Err(EngineError::CycleDetected { .. })));
    }

    #[test]
    fn empty_builder_yields_empty_plan() {
        let plan = PlanBuilder::new().build("p", "empty", "").expect("empty plan is valid");
        assert!(plan.is_empty());
        assert!(plan.execution_order.is_empty());
    }

    #[test]
    fn descendants_follow_the_full_edge_set() {
        // a → b → d, a → c, e independent
        let builder = PlanBuilder::new()
            .add_call_node("a", "s", "m", json!({}), &[])
            .add_call_node("b", "s", "m", json!({}), &["a"])
            .add_call_node("c", "s", "m", json!({}), &["a"])
            .add_call_node("d", "s", "m", json!({}), &["b"])
            .add_call_node("e", "s", "m", json!({}), &[]);
        let plan = builder.build("p", "tree", "").unwrap();

        assert_eq!(plan.descendants("a"), vec!["b", "c", "d"]);
        assert_eq!(plan.descendants("b"), vec!["d"]);
        assert!(plan.descendants("e").is_empty());
    }

    #[test]
    fn definition_round_trips_through_builder() {
        let definition: PlanDefinition = serde_json::from_value(json!({
            "name": "loaded",
            "nodes": [
                { "id": "a", "type": "external_call", "category": "search", "method": "query" },
                { "id": "b", "type": "aggregation", "function": "count", "dependencies": ["a"] }
            ]
        }))
        .unwrap();

        let plan = PlanBuilder::from_definition(definition).build("p", "loaded", "").unwrap();
        assert_eq!(plan.execution_order, vec![vec!["a"], vec!["b"]]);
    }

    /// Random DAGs: node `i` may only depend on nodes `< i`.
    fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..24).prop_flat_map(|n| {
            (0..n)
                .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(4)))
                .collect::<Vec<_>>()
                .prop_map(|deps| {
                    deps.into_iter()
                        .enumerate()
                        .map(|(i, ds)| ds.into_iter().filter(|d| *d < i).collect())
                        .collect()
                })
        })
    }

    proptest! {
        #[test]
        fn levels_partition_nodes_and_respect_dependencies(dag in arb_dag()) {
            let mut builder = PlanBuilder::new();
            for (i, deps) in dag.iter().enumerate() {
                let deps: Vec<String> = deps.iter().map(|d| format!("n{d}")).collect();
                builder = builder.add_node(
                    Node::aggregation(format!("n{i}"), AggregateFunction::Count).depends_on(deps),
                );
            }
            let plan = builder.build("p", "prop", "").unwrap();

            let mut level_of: HashMap<&str, usize> = HashMap::new();
            for (index, level) in plan.execution_order.iter().enumerate() {
                for id in level {
                    prop_assert!(level_of.insert(id.as_str(), index).is_none(), "{} scheduled twice", id);
                }
            }
            prop_assert_eq!(level_of.len(), dag.len());

            for node in plan.nodes.values() {
                let own = level_of[node.id.as_str()];
                for dep in &node.dependencies {
                    prop_assert!(level_of[dep.as_str()] < own);
                }
            }
        }
    }
}
