//! Folding per-node outcomes into a rule's status.
//!
//! Every list is keyed by node name and kept sorted, so a node appears at most once in each
//! and the serialized status only changes when an outcome does.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use crate::resources::nodereadinessrules::{
    DryRunResults, NodeEvaluation, NodeFailure, NodeReadinessRuleStatus,
};

pub const READY_CONDITION: &str = "Ready";

/// The latest known state of one matched node with respect to one rule.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeOutcome {
    pub node_name: String,
    pub evaluation: NodeEvaluation,
    /// The node carries the rule's taint
    pub tainted: bool,
    /// The node carries the rule's bootstrap completion marker
    pub completed: bool,
    pub failure: Option<NodeFailure>,
}

fn upsert_by_key<T>(list: &mut Vec<T>, key: &str, item: Option<T>, key_of: impl Fn(&T) -> &str) {
    match (list.binary_search_by(|x| key_of(x).cmp(key)), item) {
        (Ok(i), Some(item)) => list[i] = item,
        (Ok(i), None) => {
            list.remove(i);
        }
        (Err(i), Some(item)) => list.insert(i, item),
        (Err(_), None) => {}
    }
}

fn sort_lists(status: &mut NodeReadinessRuleStatus) {
    status.applied_nodes.sort();
    status.applied_nodes.dedup();
    status.completed_nodes.sort();
    status.completed_nodes.dedup();
    status.node_evaluations.sort_by(|a, b| a.node_name.cmp(&b.node_name));
    status.node_evaluations.dedup_by(|a, b| a.node_name == b.node_name);
    status.failed_nodes.sort_by(|a, b| a.node_name.cmp(&b.node_name));
    status.failed_nodes.dedup_by(|a, b| a.node_name == b.node_name);
}

/// Replaces the node's entry in every status list with the given outcome.
pub fn apply_node_outcome(status: &mut NodeReadinessRuleStatus, outcome: NodeOutcome) {
    sort_lists(status);
    let name = outcome.node_name.as_str();

    upsert_by_key(
        &mut status.applied_nodes,
        name,
        outcome.tainted.then(|| name.to_string()),
        String::as_str,
    );
    upsert_by_key(
        &mut status.completed_nodes,
        name,
        outcome.completed.then(|| name.to_string()),
        String::as_str,
    );
    upsert_by_key(
        &mut status.failed_nodes,
        name,
        outcome.failure,
        |f| f.node_name.as_str(),
    );
    upsert_by_key(
        &mut status.node_evaluations,
        name,
        Some(outcome.evaluation),
        |e| e.node_name.as_str(),
    );
}

/// Drops every entry for a node that no longer exists or no longer matches the rule.
/// Returns whether anything was removed.
pub fn remove_node(status: &mut NodeReadinessRuleStatus, node_name: &str) -> bool {
    let before = (
        status.applied_nodes.len(),
        status.completed_nodes.len(),
        status.failed_nodes.len(),
        status.node_evaluations.len(),
    );
    status.applied_nodes.retain(|n| n != node_name);
    status.completed_nodes.retain(|n| n != node_name);
    status.failed_nodes.retain(|f| f.node_name != node_name);
    status.node_evaluations.retain(|e| e.node_name != node_name);
    before
        != (
            status.applied_nodes.len(),
            status.completed_nodes.len(),
            status.failed_nodes.len(),
            status.node_evaluations.len(),
        )
}

/// Builds the complete status of a rule from the outcomes of all nodes it currently matches.
///
/// `previous` only contributes the Ready condition's transition time.
pub fn fold_rule_status(
    previous: Option<&NodeReadinessRuleStatus>,
    generation: Option<i64>,
    outcomes: impl IntoIterator<Item = NodeOutcome>,
    selector_error: Option<&str>,
    dry_run_results: Option<DryRunResults>,
    now: DateTime<Utc>,
) -> NodeReadinessRuleStatus {
    let mut status = NodeReadinessRuleStatus {
        conditions: previous.map(|p| p.conditions.clone()).unwrap_or_default(),
        dry_run_results,
        ..Default::default()
    };
    for outcome in outcomes {
        apply_node_outcome(&mut status, outcome);
    }
    refresh_ready_condition(&mut status, generation, selector_error, now);
    status
}

/// Sets observedGeneration and recomputes the Ready condition from the failed node list.
/// The transition time only moves when the condition status does.
pub fn refresh_ready_condition(
    status: &mut NodeReadinessRuleStatus,
    generation: Option<i64>,
    selector_error: Option<&str>,
    now: DateTime<Utc>,
) {
    status.observed_generation = generation;

    let (cond_status, reason, message) = match selector_error {
        Some(err) => ("Unknown", "InvalidSelector", err.to_string()),
        None if status.failed_nodes.is_empty() => (
            "True",
            "Reconciled",
            format!("{} node(s) evaluated", status.node_evaluations.len()),
        ),
        None => (
            "False",
            "NodeFailures",
            format!(
                "{} node(s) failed: {}",
                status.failed_nodes.len(),
                status
                    .failed_nodes
                    .iter()
                    .map(|f| f.node_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ),
    };

    let last_transition_time = status
        .conditions
        .iter()
        .find(|c| c.type_ == READY_CONDITION && c.status == cond_status)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or(Time(now));

    status.conditions.retain(|c| c.type_ != READY_CONDITION);
    status.conditions.push(Condition {
        type_: READY_CONDITION.into(),
        status: cond_status.into(),
        reason: reason.into(),
        message,
        observed_generation: generation,
        last_transition_time,
    });
}
