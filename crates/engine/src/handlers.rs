//! Local node logic: aggregation, conditional and transformation.
//!
//! These never touch a backend.  They read the outcomes of a node's
//! dependencies and only ever consider dependencies that COMPLETED; failed
//! or skipped dependencies are left out silently.

use std::collections::HashMap;

use serde_json::{json, Map, Number, Value};

use crate::models::{
    AggregateFunction, AggregationParams, ConditionalParams, NodeStatus, TransformKind,
    TransformParams,
};
use crate::EngineError;

/// What a dependent can see of an upstream node.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyOutcome {
    pub status: NodeStatus,
    pub result: Option<Value>,
}

impl DependencyOutcome {
    pub fn completed(result: Value) -> Self {
        Self { status: NodeStatus::Completed, result: Some(result) }
    }

    pub fn with_status(status: NodeStatus) -> Self {
        Self { status, result: None }
    }
}

pub type Outcomes = HashMap<String, DependencyOutcome>;

/// Results of completed dependencies, in declaration order.
fn completed_results<'a>(
    dependencies: &'a [String],
    outcomes: &'a Outcomes,
) -> impl Iterator<Item = &'a Value> + 'a {
    dependencies.iter().filter_map(move |dep| {
        outcomes
            .get(dep)
            .filter(|o| o.status == NodeStatus::Completed)
            .and_then(|o| o.result.as_ref())
    })
}

fn shallow_merge<'a>(results: impl Iterator<Item = &'a Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for object in results.filter_map(Value::as_object) {
        for (key, value) in object {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn sum<'a>(results: impl Iterator<Item = &'a Value>) -> Value {
    let mut exact: Option<i64> = Some(0);
    let mut approx = 0.0_f64;

    let numbers = results.filter_map(|v| match v {
        Value::Number(n) => Some(n),
        _ => None,
    });
    for number in numbers {
        approx += number.as_f64().unwrap_or(0.0);
        exact = match (exact, number.as_i64()) {
            (Some(total), Some(n)) => total.checked_add(n),
            _ => None,
        };
    }

    match exact {
        Some(total) => Value::Number(total.into()),
        None => Number::from_f64(approx).map_or(Value::Null, Value::Number),
    }
}

pub fn aggregate(params: &AggregationParams, dependencies: &[String], outcomes: &Outcomes) -> Value {
    let results = completed_results(dependencies, outcomes);
    match params.function {
        AggregateFunction::Merge => Value::Object(shallow_merge(results)),
        AggregateFunction::List => Value::Array(results.cloned().collect()),
        AggregateFunction::Count => json!(results.count()),
        AggregateFunction::Sum => sum(results),
    }
}

/// Parsed form of a condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Condition<'a> {
    Literal(bool),
    HasResult(&'a str),
}

fn parse_condition(expression: &str) -> Option<Condition<'_>> {
    match expression.trim() {
        "true" => Some(Condition::Literal(true)),
        "false" => Some(Condition::Literal(false)),
        other => other
            .strip_prefix("has_result:")
            .map(str::trim)
            .filter(|dep| !dep.is_empty())
            .map(Condition::HasResult),
    }
}

/// Evaluate the condition and return the decision record.
///
/// The chosen branch is only reported; running it is up to the caller.
pub fn evaluate_condition(
    node_id: &str,
    params: &ConditionalParams,
    dependencies: &[String],
    outcomes: &Outcomes,
) -> Result<Value, EngineError> {
    let condition = parse_condition(&params.condition).ok_or_else(|| EngineError::Validation {
        node_id: node_id.to_owned(),
        message: format!("unsupported condition '{}'", params.condition),
    })?;

    let result = match condition {
        Condition::Literal(value) => value,
        Condition::HasResult(dep) => {
            if !dependencies.iter().any(|d| d == dep) {
                return Err(EngineError::Validation {
                    node_id: node_id.to_owned(),
                    message: format!("condition references '{dep}', which is not a dependency"),
                });
            }
            outcomes
                .get(dep)
                .is_some_and(|o| o.status == NodeStatus::Completed)
        }
    };

    let selected = if result { &params.true_branch } else { &params.false_branch };
    Ok(json!({
        "condition": params.condition,
        "result": result,
        "selected_branch": selected,
    }))
}

pub fn transform(
    node_id: &str,
    params: &TransformParams,
    dependencies: &[String],
    outcomes: &Outcomes,
) -> Result<Value, EngineError> {
    let merged = shallow_merge(completed_results(dependencies, outcomes));
    match params.transform {
        TransformKind::Flatten => Ok(Value::Object(merged)),
        TransformKind::ExtractKeys => {
            if params.keys.is_empty() {
                return Err(EngineError::Validation {
                    node_id: node_id.to_owned(),
                    message: "extract_keys needs at least one key".into(),
                });
            }
            let projected = params
                .keys
                .iter()
                .filter_map(|key| merged.get(key).map(|v| (key.clone(), v.clone())))
                .collect();
            Ok(Value::Object(projected))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_owned()).collect()
    }

    fn outcomes(entries: &[(&str, DependencyOutcome)]) -> Outcomes {
        entries.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    fn agg(function: AggregateFunction) -> AggregationParams {
        AggregationParams { function }
    }

    #[test]
    fn merge_later_dependency_wins() {
        let o = outcomes(&[
            ("a", DependencyOutcome::completed(json!({ "k": 1, "a": true }))),
            ("b", DependencyOutcome::completed(json!({ "k": 2 }))),
        ]);
        let merged = aggregate(&agg(AggregateFunction::Merge), &deps(&["a", "b"]), &o);
        assert_eq!(merged, json!({ "k": 2, "a": true }));

        let reversed = aggregate(&agg(AggregateFunction::Merge), &deps(&["b", "a"]), &o);
        assert_eq!(reversed["k"], 1);
    }

    #[test]
    fn list_follows_declaration_order_and_drops_failures() {
        let o = outcomes(&[
            ("a", DependencyOutcome::completed(json!(1))),
            ("b", DependencyOutcome::with_status(NodeStatus::Failed)),
            ("c", DependencyOutcome::completed(json!(3))),
            ("d", DependencyOutcome::with_status(NodeStatus::Skipped)),
        ]);
        let list = aggregate(&agg(AggregateFunction::List), &deps(&["c", "b", "a", "d"]), &o);
        assert_eq!(list, json!([3, 1]));
    }

    #[test]
    fn list_of_nothing_is_empty() {
        let list = aggregate(&agg(AggregateFunction::List), &[], &Outcomes::new());
        assert_eq!(list, json!([]));
    }

    #[test]
    fn list_preserves_order_for_any_size() {
        for n in 0..12 {
            let ids: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
            let o: Outcomes = ids
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), DependencyOutcome::completed(json!(i))))
                .collect();
            let expected: Vec<Value> = (0..n).map(|i| json!(i)).collect();
            assert_eq!(aggregate(&agg(AggregateFunction::List), &ids, &o), Value::Array(expected));
        }
    }

    #[test]
    fn count_counts_completed_only() {
        let o = outcomes(&[
            ("a", DependencyOutcome::completed(json!(null))),
            ("b", DependencyOutcome::with_status(NodeStatus::Failed)),
        ]);
        assert_eq!(aggregate(&agg(AggregateFunction::Count), &deps(&["a", "b"]), &o), json!(1));
    }

    #[test]
    fn sum_ignores_non_numeric_results() {
        let o = outcomes(&[
            ("a", DependencyOutcome::completed(json!(2))),
            ("b", DependencyOutcome::completed(json!("three"))),
            ("c", DependencyOutcome::completed(json!(5))),
        ]);
        assert_eq!(aggregate(&agg(AggregateFunction::Sum), &deps(&["a", "b", "c"]), &o), json!(7));

        let with_float = outcomes(&[
            ("a", DependencyOutcome::completed(json!(1))),
            ("b", DependencyOutcome::completed(json!(0.5))),
        ]);
        assert_eq!(
            aggregate(&agg(AggregateFunction::Sum), &deps(&["a", "b"]), &with_float),
            json!(1.5)
        );
    }

    fn cond(condition: &str) -> ConditionalParams {
        ConditionalParams {
            condition: condition.into(),
            true_branch: deps(&["yes"]),
            false_branch: deps(&["no"]),
        }
    }

    #[test]
    fn literal_conditions_select_branch() {
        let t = evaluate_condition("c", &cond("true"), &[], &Outcomes::new()).unwrap();
        assert_eq!(t, json!({ "condition": "true", "result": true, "selected_branch": ["yes"] }));

        let f = evaluate_condition("c", &cond(" false "), &[], &Outcomes::new()).unwrap();
        assert_eq!(f["result"], false);
        assert_eq!(f["selected_branch"], json!(["no"]));
    }

    #[test]
    fn has_result_checks_dependency_status() {
        let o = outcomes(&[
            ("a", DependencyOutcome::completed(json!(1))),
            ("b", DependencyOutcome::with_status(NodeStatus::Failed)),
        ]);
        let d = deps(&["a", "b"]);
        assert_eq!(evaluate_condition("c", &cond("has_result:a"), &d, &o).unwrap()["result"], true);
        assert_eq!(evaluate_condition("c", &cond("has_result:b"), &d, &o).unwrap()["result"], false);
    }

    #[test]
    fn malformed_conditions_are_validation_errors() {
        for bad in ["maybe", "has_result:", "has_result:z"] {
            let err = evaluate_condition("c", &cond(bad), &deps(&["a"]), &Outcomes::new()).unwrap_err();
            assert!(matches!(err, EngineError::Validation { ref node_id, .. } if node_id == "c"), "{bad}");
        }
    }

    #[test]
    fn flatten_merges_object_results() {
        let o = outcomes(&[
            ("a", DependencyOutcome::completed(json!({ "x": 1 }))),
            ("b", DependencyOutcome::completed(json!([1, 2]))),
            ("c", DependencyOutcome::completed(json!({ "y": 2 }))),
        ]);
        let params = TransformParams { transform: TransformKind::Flatten, keys: vec![] };
        let out = transform("t", &params, &deps(&["a", "b", "c"]), &o).unwrap();
        assert_eq!(out, json!({ "x": 1, "y": 2 }));
    }

    #[test]
    fn extract_keys_projects_subset() {
        let o = outcomes(&[
            ("a", DependencyOutcome::completed(json!({ "x": 1, "noise": true }))),
            ("b", DependencyOutcome::completed(json!({ "y": 2 }))),
        ]);
        let params = TransformParams {
            transform: TransformKind::ExtractKeys,
            keys: deps(&["x", "y", "missing"]),
        };
        let out = transform("t", &params, &deps(&["a", "b"]), &o).unwrap();
        assert_eq!(out, json!({ "x": 1, "y": 2 }));
    }

    #[test]
    fn extract_keys_without_keys_is_rejected() {
        let params = TransformParams { transform: TransformKind::ExtractKeys, keys: vec![] };
        assert!(matches!(
            transform("t", &params, &[], &Outcomes::new()),
            Err(EngineError::Validation { .. })
        ));
    }
}
