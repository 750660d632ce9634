use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{Node, NodeCondition};

use crate::resources::nodereadinessrules::{
    ConditionEvaluationResult, ConditionRequirement, ConditionStatus,
};

/// Per-requirement results, in requirement order, and their conjunction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConditionEvaluation {
    pub results: Vec<ConditionEvaluationResult>,
    pub all_satisfied: bool,
}

pub fn node_conditions(node: &Node) -> &[NodeCondition] {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// Evaluates the node's conditions against a rule's requirements.
///
/// Never fails: a condition the node does not report is Unknown and unsatisfied.
/// If the node reports a type twice the later entry wins. No requirements means satisfied.
pub fn evaluate(
    conditions: &[NodeCondition],
    requirements: &[ConditionRequirement],
) -> ConditionEvaluation {
    let by_type: HashMap<&str, &str> = conditions
        .iter()
        .map(|c| (c.type_.as_str(), c.status.as_str()))
        .collect();

    let results: Vec<ConditionEvaluationResult> = requirements
        .iter()
        .map(|req| match by_type.get(req.r#type.as_str()) {
            None => ConditionEvaluationResult {
                r#type: req.r#type.clone(),
                current_status: ConditionStatus::Unknown,
                required_status: req.required_status,
                satisfied: false,
                missing: true,
            },
            Some(status) => {
                let current_status = ConditionStatus::from_node_status(status);
                ConditionEvaluationResult {
                    r#type: req.r#type.clone(),
                    current_status,
                    required_status: req.required_status,
                    satisfied: current_status == req.required_status,
                    missing: false,
                }
            }
        })
        .collect();

    ConditionEvaluation {
        all_satisfied: results.iter().all(|r| r.satisfied),
        results,
    }
}

/// Order-independent comparison of the (type, status) pairs of two condition lists.
/// Heartbeat and transition timestamps are ignored.
pub fn conditions_equal(a: &[NodeCondition], b: &[NodeCondition]) -> bool {
    fn as_map(conditions: &[NodeCondition]) -> BTreeMap<&str, &str> {
        conditions
            .iter()
            .map(|c| (c.type_.as_str(), c.status.as_str()))
            .collect()
    }

    a.len() == b.len() && as_map(a) == as_map(b)
}

pub fn labels_equal(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> bool {
    a == b
}
