use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::bounded_name;
use super::nodereadinessrules::{ConditionEvaluationResult, TaintStatus};

/// Label carrying the rule name on every evaluation record
pub const RULE_NAME_LABEL: &str = "readiness.k8s.io/rule";
/// Label carrying the node name on every evaluation record
pub const NODE_NAME_LABEL: &str = "readiness.k8s.io/node";

/// NodeReadinessEvaluation records the latest evaluation of one node against one NodeReadinessRule.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "NodeReadinessEvaluation",
    group = "nodereadiness.io",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Node", "type":"string", "jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Rule", "type":"string", "jsonPath":".spec.ruleName"}"#,
    printcolumn = r#"{"name":"TaintStatus", "type":"string", "jsonPath":".status.taintStatus"}"#,
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.allConditionsSatisfied"}"#,
    printcolumn = r#"{"name":"Evaluations", "type":"integer", "jsonPath":".status.evaluationCount", "priority": 1}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "NodeReadinessEvaluationStatus", shortname = "nre")]
#[serde(rename_all = "camelCase")]
pub struct NodeReadinessEvaluationSpec {
    pub rule_name: String,
    pub node_name: String,
    /// Generation of the rule at evaluation time
    pub rule_generation: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeReadinessEvaluationStatus {
    #[serde(default)]
    pub condition_results: Vec<ConditionEvaluationResult>,
    pub all_conditions_satisfied: bool,
    pub taint_status: TaintStatus,
    pub last_evaluated: Option<Time>,
    #[serde(default)]
    pub evaluation_count: i64,
    pub last_error: Option<String>,
    /// Machine-readable counterpart of lastError, mirrored into the rule's failedNodes
    pub last_error_reason: Option<String>,
    pub last_error_time: Option<Time>,
    #[serde(default)]
    pub consecutive_errors: i32,
    /// When the conditions were first seen unsatisfied; the start of the grace period.
    /// Cleared once the conditions are satisfied.
    pub unsatisfied_since: Option<Time>,
}

/// Name of the evaluation record for a (rule, node) pair.
///
/// Both are DNS subdomains, so `<rule>.<node>` is a valid object name as long as it fits in 253 characters.
/// Longer pairs are truncated and suffixed with a hash of the full pair.
pub fn evaluation_name(rule_name: &str, node_name: &str) -> String {
    bounded_name(format!("{rule_name}.{node_name}"), 253)
}

/// Label value for a rule or node name. Label values are capped at 63 characters,
/// so longer names are truncated and suffixed with a hash; record lookups still
/// compare against the spec fields.
pub fn label_value(name: &str) -> String {
    bounded_name(name.to_string(), 63)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_joined() {
        assert_eq!(evaluation_name("cni", "node-a"), "cni.node-a");
    }

    #[test]
    fn long_names_are_truncated_and_hashed() {
        let node = "n".repeat(250);
        let a = evaluation_name("rule-a", &node);
        let b = evaluation_name("rule-b", &node);
        assert!(a.len() <= 253);
        assert_ne!(a, b);
        assert_eq!(a, evaluation_name("rule-a", &node));
    }

    #[test]
    fn label_values_fit() {
        let long = "x".repeat(100);
        assert_eq!(label_value("node-a"), "node-a");
        assert!(label_value(&long).len() <= 63);
    }

    #[test]
    fn status_defaults_are_zero() {
        let status: NodeReadinessEvaluationStatus = serde_json::from_value(serde_json::json!({
            "allConditionsSatisfied": false,
            "taintStatus": "Unknown"
        }))
        .unwrap();
        assert_eq!(status.evaluation_count, 0);
        assert_eq!(status.consecutive_errors, 0);
        assert!(status.condition_results.is_empty());
    }
}
