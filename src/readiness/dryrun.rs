use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;

use super::conditions::{evaluate, node_conditions};
use super::state::{decide, DecisionInput, TaintAction};
use super::{bootstrap, taints};
use crate::resources::nodereadinessrules::{DryRunResults, NodeReadinessRuleSpec};

/// What the taint state machine would do to each matched node, without doing it.
///
/// Grace periods are not simulated: a node that is unsatisfied and untainted counts as a
/// prospective addition. Every addition is risky since it can evict or block workloads.
pub fn analyze<'a>(
    rule_name: &str,
    spec: &NodeReadinessRuleSpec,
    matched_nodes: impl IntoIterator<Item = &'a Node>,
    now: DateTime<Utc>,
) -> DryRunResults {
    let mut results = DryRunResults::default();

    for node in matched_nodes {
        let evaluation = evaluate(node_conditions(node), &spec.conditions);
        let decision = decide(DecisionInput {
            mode: spec.enforcement_mode,
            all_satisfied: evaluation.all_satisfied,
            has_taint: taints::node_has_taint(node, &spec.taint),
            completed: bootstrap::is_completed(node, rule_name),
            grace_period: None,
            unsatisfied_since: None,
            now,
        });

        match decision.action {
            TaintAction::Add => {
                results.taints_to_add += 1;
                results.risky_operations += 1;
            }
            TaintAction::Remove => results.taints_to_remove += 1,
            TaintAction::Keep => continue,
        }
        results.affected_nodes += 1;
    }

    results.summary = summarize(&results);
    results
}

fn summarize(results: &DryRunResults) -> String {
    if results.affected_nodes == 0 {
        return "No changes: every matched node is already in the desired state".into();
    }
    let mut summary = format!(
        "{} node(s) affected: {} taint(s) to add, {} to remove",
        results.affected_nodes, results.taints_to_add, results.taints_to_remove
    );
    if results.risky_operations > 0 {
        summary.push_str(&format!(
            "; {} risky operation(s) may disrupt workloads",
            results.risky_operations
        ));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::nodereadinessrules::{
        ConditionRequirement, ConditionStatus, EnforcementMode, TaintEffect, TaintSpec,
    };
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus, Taint};

    fn rule() -> NodeReadinessRuleSpec {
        NodeReadinessRuleSpec {
            conditions: vec![ConditionRequirement {
                r#type: "Ready".into(),
                required_status: ConditionStatus::True,
            }],
            enforcement_mode: EnforcementMode::Continuous,
            taint: TaintSpec {
                key: "readiness.k8s.io/not-ready".into(),
                effect: TaintEffect::NoSchedule,
                value: None,
            },
            dry_run: true,
            ..Default::default()
        }
    }

    fn node(ready: &str, tainted: bool) -> Node {
        Node {
            spec: Some(NodeSpec {
                taints: tainted.then(|| {
                    vec![Taint {
                        key: "readiness.k8s.io/not-ready".into(),
                        effect: "NoSchedule".into(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: ready.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn counts_prospective_changes() {
        let nodes = [node("False", false), node("False", false), node("True", true)];
        let results = analyze("r", &rule(), &nodes, Utc::now());

        assert_eq!(results.taints_to_add, 2);
        assert_eq!(results.taints_to_remove, 1);
        assert_eq!(results.risky_operations, 2);
        assert_eq!(results.affected_nodes, 3);
        assert_eq!(
            results.summary,
            "3 node(s) affected: 2 taint(s) to add, 1 to remove; 2 risky operation(s) may disrupt workloads"
        );
    }

    #[test]
    fn steady_nodes_are_not_affected() {
        let nodes = [node("True", false), node("False", true)];
        let results = analyze("r", &rule(), &nodes, Utc::now());
        assert_eq!(results.affected_nodes, 0);
        assert_eq!(results.risky_operations, 0);
        assert!(results.summary.starts_with("No changes"));
    }

    #[test]
    fn completed_bootstrap_nodes_are_left_alone() {
        let mut spec = rule();
        spec.enforcement_mode = EnforcementMode::BootstrapOnly;
        let mut n = node("False", false);
        bootstrap::mark_completed(&mut n, "r");

        let results = analyze("r", &spec, [&n], Utc::now());
        assert_eq!(results.taints_to_add, 0);
        assert_eq!(results.affected_nodes, 0);
    }

    #[test]
    fn removals_alone_are_not_risky() {
        let nodes = [node("True", true)];
        let results = analyze("r", &rule(), &nodes, Utc::now());
        assert_eq!(results.risky_operations, 0);
        assert_eq!(results.summary, "1 node(s) affected: 0 taint(s) to add, 1 to remove");
    }
}
