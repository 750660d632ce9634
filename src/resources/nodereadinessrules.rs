use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use kube::CustomResource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::duration_parser::DurationParser;

pub static NODE_READINESS_RULE_FINALIZER: &str = "nodereadinessrules.readiness.k8s.io/cleanup";

/// NodeReadinessRule taints nodes until they report a set of node conditions, and removes the taint once they do.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "NodeReadinessRule",
    group = "nodereadiness.io",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.enforcementMode"}"#,
    printcolumn = r#"{"name":"Taint", "type":"string", "jsonPath":".spec.taint.key"}"#,
    printcolumn = r#"{"name":"DryRun", "type":"boolean", "jsonPath":".spec.dryRun", "priority": 1}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "NodeReadinessRuleStatus", shortname = "nrr")]
#[serde(rename_all = "camelCase")]
pub struct NodeReadinessRuleSpec {
    /// Node conditions that must all be satisfied for the taint to be removed.
    pub conditions: Vec<ConditionRequirement>,

    /// Whether the rule is enforced once while the node bootstraps, or continuously for the node's lifetime.
    pub enforcement_mode: EnforcementMode,

    /// The taint applied to nodes that do not satisfy the conditions.
    pub taint: TaintSpec,

    /// Restricts the nodes this rule applies to. Unset matches every node.
    #[schemars(default, schema_with = "label_selector_schema")]
    pub node_selector: Option<LabelSelector>,

    /// How long conditions must stay unsatisfied before the taint is added, e.g. `30s` or `2m`.
    /// Removal of the taint is never delayed.
    pub grace_period: Option<String>,

    /// If true, report what would change in status.dryRunResults without touching any node.
    #[serde(default)]
    pub dry_run: bool,
}

impl NodeReadinessRuleSpec {
    /// The configured grace period, if any. An unparseable value is a configuration error.
    pub fn grace_period(&self) -> Result<Option<Duration>, crate::Error> {
        match &self.grace_period {
            None => Ok(None),
            Some(raw) => raw
                .to_duration()
                .map(Some)
                .map_err(|err| crate::Error::InvalidRuleConfig(format!("gracePeriod: {err}"))),
        }
    }
}

fn label_selector_schema(_g: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(serde_json::json!({
      "description": "nodeSelector restricts the nodes this rule applies to. Unset matches every node.",
      "nullable": true,
      "properties": {
        "matchExpressions": {
          "description": "matchExpressions is a list of label selector requirements. The requirements are ANDed.",
          "items": {
            "properties": {
              "key": {
                "description": "key is the label key that the selector applies to.",
                "type": "string"
              },
              "operator": {
                "description": "operator represents a key's relationship to a set of values.\nValid operators are In, NotIn, Exists and DoesNotExist.",
                "type": "string"
              },
              "values": {
                "items": {
                  "type": "string"
                },
                "type": "array",
                "x-kubernetes-list-type": "atomic"
              }
            },
            "required": [
              "key",
              "operator"
            ],
            "type": "object"
          },
          "type": "array",
          "x-kubernetes-list-type": "atomic"
        },
        "matchLabels": {
          "additionalProperties": {
            "type": "string"
          },
          "description": "matchLabels is a map of {key,value} pairs. The requirements are ANDed.",
          "type": "object"
        }
      },
      "type": "object",
      "x-kubernetes-map-type": "atomic"
    }))
    .unwrap()
}

/// A node condition the node must report, and the status it must report it with.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRequirement {
    /// Node condition type, e.g. `Ready` or `network.kubernetes.io/CNIReady`.
    #[serde(rename = "type")]
    pub r#type: String,
    pub required_status: ConditionStatus,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Node conditions carry their status as a plain string; anything unrecognised is Unknown.
    pub fn from_node_status(status: &str) -> Self {
        match status {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EnforcementMode {
    /// Enforce only until the node first satisfies the conditions.
    #[serde(rename = "bootstrap-only")]
    BootstrapOnly,
    /// Re-evaluate and re-apply the taint on every reconciliation.
    #[default]
    #[serde(rename = "continuous")]
    Continuous,
}

/// The taint managed by a rule. (key, effect) identifies it on the node.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaintSpec {
    pub key: String,
    pub effect: TaintEffect,
    pub value: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSchedule => "NoSchedule",
            Self::PreferNoSchedule => "PreferNoSchedule",
            Self::NoExecute => "NoExecute",
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TaintSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}:{}", self.key, value, self.effect),
            None => write!(f, "{}:{}", self.key, self.effect),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TaintStatus {
    Present,
    Absent,
    #[default]
    Unknown,
}

/// Status of the NodeReadinessRule. Lists are always serialized so that a merge patch can empty them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeReadinessRuleStatus {
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Nodes currently carrying the rule's taint
    #[serde(default)]
    pub applied_nodes: Vec<String>,
    #[serde(default)]
    pub node_evaluations: Vec<NodeEvaluation>,
    /// Nodes which finished bootstrap-only enforcement
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub failed_nodes: Vec<NodeFailure>,
    pub dry_run_results: Option<DryRunResults>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvaluation {
    pub node_name: String,
    pub condition_results: Vec<ConditionEvaluationResult>,
    pub taint_status: TaintStatus,
    pub last_evaluated: Time,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionEvaluationResult {
    #[serde(rename = "type")]
    pub r#type: String,
    pub current_status: ConditionStatus,
    pub required_status: ConditionStatus,
    pub satisfied: bool,
    /// True when the node does not report this condition at all
    pub missing: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailure {
    pub node_name: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_updated: Time,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResults {
    pub affected_nodes: i32,
    pub taints_to_add: i32,
    pub taints_to_remove: i32,
    /// Operations which could disrupt running workloads; currently every taint addition
    pub risky_operations: i32,
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn spec_round_trips_through_json() {
        let raw = json!({
            "conditions": [{"type": "network.kubernetes.io/CNIReady", "requiredStatus": "True"}],
            "enforcementMode": "bootstrap-only",
            "taint": {"key": "readiness.k8s.io/cni-not-ready", "effect": "NoSchedule"},
            "nodeSelector": {"matchLabels": {"pool": "gpu"}},
            "gracePeriod": "30s",
            "dryRun": true
        });

        let spec: NodeReadinessRuleSpec = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(spec.enforcement_mode, EnforcementMode::BootstrapOnly);
        assert_eq!(spec.conditions[0].required_status, ConditionStatus::True);
        assert_eq!(spec.grace_period().unwrap(), Some(Duration::from_secs(30)));
        assert!(spec.dry_run);

        let mut back = serde_json::to_value(&spec).unwrap();
        // value is optional and serialized as null
        back["taint"].as_object_mut().unwrap().remove("value");
        assert_json_eq!(back, raw);
    }

    #[test]
    fn dry_run_defaults_to_false() {
        let spec: NodeReadinessRuleSpec = serde_json::from_value(json!({
            "conditions": [],
            "enforcementMode": "continuous",
            "taint": {"key": "k", "effect": "NoExecute", "value": "v"}
        }))
        .unwrap();
        assert!(!spec.dry_run);
        assert_eq!(spec.taint.value.as_deref(), Some("v"));
        assert_eq!(spec.grace_period().unwrap(), None);
    }

    #[test]
    fn invalid_grace_period_is_a_config_error() {
        for raw in ["soon", "99999999999999999999h"] {
            let spec = NodeReadinessRuleSpec {
                grace_period: Some(raw.into()),
                ..Default::default()
            };
            assert!(matches!(
                spec.grace_period(),
                Err(crate::Error::InvalidRuleConfig(_))
            ));
        }
    }

    #[test]
    fn empty_status_serializes_empty_lists() {
        let value = serde_json::to_value(NodeReadinessRuleStatus::default()).unwrap();
        assert_json_eq!(
            value,
            json!({
                "observedGeneration": null,
                "conditions": [],
                "appliedNodes": [],
                "nodeEvaluations": [],
                "completedNodes": [],
                "failedNodes": [],
                "dryRunResults": null
            })
        );
    }

    #[test]
    fn taint_display() {
        let taint = TaintSpec {
            key: "example.com/not-ready".into(),
            effect: TaintEffect::NoExecute,
            value: Some("pending".into()),
        };
        assert_eq!(taint.to_string(), "example.com/not-ready=pending:NoExecute");
    }
}
