//! The reconciliation engine shared by the node and rule controllers.
//!
//! A node reconciliation evaluates every cached rule against one node and commits the outcome in
//! three phases: one node write carrying all taint changes, one node write carrying new bootstrap
//! completion markers, then the evaluation records and rule statuses. Each phase is idempotent, so
//! a conflict anywhere restarts the whole evaluation against a fresh read.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tokio::sync::OwnedMutexGuard;
use tracing::*;

use super::rule_cache::{CachedRule, RuleCache};
use super::Settings;
use crate::readiness::conditions::{evaluate, node_conditions, ConditionEvaluation};
use crate::readiness::selector::matches_node;
use crate::readiness::state::{decide, DecisionInput, TaintAction, TaintDecision};
use crate::readiness::status::{
    apply_node_outcome, fold_rule_status, refresh_ready_condition, remove_node, NodeOutcome,
};
use crate::readiness::{bootstrap, dryrun, taints};
use crate::resources::nodereadinessevaluations::{
    evaluation_name, label_value, NodeReadinessEvaluation, NodeReadinessEvaluationSpec,
    NodeReadinessEvaluationStatus, NODE_NAME_LABEL, RULE_NAME_LABEL,
};
use crate::resources::nodereadinessrules::{
    NodeEvaluation, NodeFailure, NodeReadinessRule, NodeReadinessRuleSpec,
    NodeReadinessRuleStatus, TaintSpec, TaintStatus,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::ClusterStore;
use crate::{Error, Metrics, Result};

/// One async mutex per node name. Entries are dropped once nobody holds or waits for them.
#[derive(Clone, Default)]
struct NodeLocks(Arc<Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>>);

impl NodeLocks {
    async fn lock(&self, node_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.0.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, l| l.strong_count() > 0);
            match locks.get(node_name).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(node_name.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeReconcile {
    /// Set while a grace period is holding back a taint
    pub requeue_after: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleReconcile {
    /// Nodes the rule currently applies to, each of which needs a node reconciliation
    pub matched_nodes: Vec<String>,
    /// None when the rule cannot be evaluated until it changes
    pub requeue_after: Option<Duration>,
}

/// An error recorded on an evaluation record
#[derive(Clone, Debug, PartialEq, Eq)]
struct Failure {
    reason: String,
    message: String,
    /// Errors this failure stands for, added to consecutiveErrors
    count: i32,
}

impl Failure {
    fn from_error(err: &Error) -> Self {
        Self {
            reason: err.metric_label().into(),
            message: err.to_string(),
            count: 1,
        }
    }
}

/// What one rule wants done to the node under reconciliation
struct Plan {
    rule: Arc<CachedRule>,
    rule_name: String,
    record_name: String,
    previous: Option<NodeReadinessEvaluation>,
    evaluation: ConditionEvaluation,
    /// Err holds a configuration problem that prevents a decision
    decision: Result<TaintDecision, String>,
}

impl Plan {
    fn spec(&self) -> &NodeReadinessRuleSpec {
        &self.rule.rule.spec
    }

    fn mutates(&self) -> bool {
        !self.spec().dry_run
    }

    fn unsatisfied_since(&self) -> Option<DateTime<Utc>> {
        match &self.decision {
            Ok(decision) => decision.unsatisfied_since,
            Err(_) => self
                .previous
                .as_ref()
                .and_then(|p| p.status.as_ref())
                .and_then(|s| s.unsatisfied_since.as_ref())
                .map(|t| t.0),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn ClusterStore>,
    cache: RuleCache,
    node_locks: NodeLocks,
    /// Evaluation records whose last write failed, with the failure to surface on the next pass
    unrecorded: Arc<Mutex<HashMap<String, Failure>>>,
    /// Grace period baselines of evaluation records whose last write failed
    baselines: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    retry: RetryConfig,
    resync: Duration,
    metrics: Metrics,
}

impl Engine {
    pub fn new(store: Arc<dyn ClusterStore>, settings: &Settings, metrics: Metrics) -> Self {
        Self {
            store,
            cache: RuleCache::default(),
            node_locks: NodeLocks::default(),
            unrecorded: Default::default(),
            baselines: Default::default(),
            retry: RetryConfig::with_retries(settings.max_conflict_retries),
            resync: settings.resync,
            metrics,
        }
    }

    pub fn rule_cache(&self) -> &RuleCache {
        &self.cache
    }

    pub fn resync(&self) -> Duration {
        self.resync
    }

    /// Reloads the rule cache from the store.
    pub async fn rebuild_rule_cache(&self) -> Result<()> {
        let rules = self.store.list_rules().await?;
        self.cache.rebuild(rules);
        info!(rules = self.cache.len(), "Rule cache rebuilt");
        Ok(())
    }

    /// Converges one node's taints with every cached rule that applies to it.
    ///
    /// Reconciliations of the same node never overlap. Version conflicts restart the evaluation
    /// with backoff; once retries are exhausted the failure is recorded on the evaluation records
    /// and returned as [`Error::ConflictRetriesExhausted`]. A node deleted mid-write is forgotten.
    pub async fn reconcile_node(&self, node_name: &str) -> Result<NodeReconcile> {
        let _guard = self.node_locks.lock(node_name).await;

        let result = retry_with_backoff(&self.retry, "reconcile node", Error::is_conflict, move || {
            self.evaluate_and_commit(node_name)
        })
        .await;

        match result {
            Err(err) if err.is_conflict() => {
                let err = Error::ConflictRetriesExhausted {
                    node: node_name.to_string(),
                    attempts: self.retry.max_attempts,
                };
                warn!(node = node_name, "{err}");
                if let Err(record_err) = self.record_failure(node_name, &err).await {
                    warn!(node = node_name, "Failed to record exhausted retries: {record_err}");
                }
                Err(err)
            }
            Err(err) if err.is_not_found() => {
                debug!(node = node_name, "Node deleted during reconciliation");
                self.forget_node(node_name).await;
                Ok(NodeReconcile {
                    requeue_after: None,
                })
            }
            result => result,
        }
    }

    async fn evaluate_and_commit(&self, node_name: &str) -> Result<NodeReconcile> {
        let Some(mut node) = self.store.get_node(node_name).await? else {
            debug!(node = node_name, "Node no longer exists");
            self.forget_node(node_name).await;
            return Ok(NodeReconcile {
                requeue_after: None,
            });
        };
        let now = Utc::now();
        let (plans, unmatched) = self.plan(&node, now).await?;

        // all taint changes in a single write
        let mut updated = node.clone();
        let mut taint_ops = vec![];
        for plan in plans.iter().filter(|p| p.mutates()) {
            let Ok(decision) = &plan.decision else {
                continue;
            };
            let changed = match decision.action {
                TaintAction::Add => taints::set_node_taint(&mut updated, &plan.spec().taint, true, now),
                TaintAction::Remove => {
                    taints::set_node_taint(&mut updated, &plan.spec().taint, false, now)
                }
                TaintAction::Keep => false,
            };
            if changed {
                taint_ops.push((plan, decision.action));
            }
        }
        if !taint_ops.is_empty() {
            node = self.store.replace_node(&updated).await?;
            for (plan, action) in taint_ops {
                info!(
                    node = node_name,
                    rule = %plan.rule_name,
                    taint = %plan.spec().taint,
                    "{} taint",
                    if action == TaintAction::Add { "Added" } else { "Removed" }
                );
                self.metrics.taint_operation(&plan.rule_name, action);
            }
        }

        // completion markers only once the taint removal they follow is committed
        let mut updated = node.clone();
        let mut completed = vec![];
        for plan in plans.iter().filter(|p| p.mutates()) {
            if matches!(&plan.decision, Ok(d) if d.mark_completed)
                && bootstrap::mark_completed(&mut updated, &plan.rule_name)
            {
                completed.push(plan.rule_name.as_str());
            }
        }
        if !completed.is_empty() {
            node = self.store.replace_node(&updated).await?;
            for rule in completed {
                info!(node = node_name, rule, "Bootstrap completed");
                self.metrics.bootstrap_completed(rule);
            }
        }

        let mut requeue_after: Option<Duration> = None;
        for plan in &plans {
            let failure = plan.decision.as_ref().err().map(|message| Failure {
                reason: "InvalidRuleConfig".into(),
                message: message.clone(),
                count: 1,
            });
            let taint_status = taint_status(&node, &plan.spec().taint);
            self.record(&node, plan, taint_status, failure, now).await;

            if let Some(remaining) = plan.decision.as_ref().ok().and_then(|d| d.grace_remaining) {
                debug!(node = node_name, rule = %plan.rule_name, ?remaining, "Taint held back by grace period");
                requeue_after = Some(requeue_after.map_or(remaining, |r| r.min(remaining)));
            }
        }

        for rule_name in unmatched {
            if let Err(err) = self
                .update_rule_status(&rule_name, |status, _| remove_node(status, node_name))
                .await
            {
                warn!(node = node_name, rule = %rule_name, "Failed to update rule status: {err}");
            }
        }

        Ok(NodeReconcile { requeue_after })
    }

    /// Evaluates every cached rule against the node. Rules that do not apply are returned by name.
    async fn plan(&self, node: &Node, now: DateTime<Utc>) -> Result<(Vec<Plan>, Vec<String>)> {
        let node_name = node.name_any();
        let mut plans = vec![];
        let mut unmatched = vec![];

        for rule in self.cache.snapshot() {
            let rule_name = rule.name();
            // an invalid selector applies to no node; the rule's own status reports it
            let Ok(selector) = &rule.selector else {
                continue;
            };
            if !matches_node(selector, node) {
                unmatched.push(rule_name);
                continue;
            }

            let record_name = evaluation_name(&rule_name, &node_name);
            let previous = self.store.get_evaluation(&record_name).await?;
            let spec = &rule.rule.spec;
            let evaluation = evaluate(node_conditions(node), &spec.conditions);

            let decision = match &rule.grace_period {
                Err(message) => Err(message.clone()),
                Ok(grace_period) => Ok(decide(DecisionInput {
                    mode: spec.enforcement_mode,
                    all_satisfied: evaluation.all_satisfied,
                    has_taint: taints::node_has_taint(node, &spec.taint),
                    completed: bootstrap::is_completed(node, &rule_name),
                    grace_period: *grace_period,
                    unsatisfied_since: previous
                        .as_ref()
                        .and_then(|p| p.status.as_ref())
                        .and_then(|s| s.unsatisfied_since.as_ref())
                        .map(|t| t.0)
                        .or_else(|| self.unrecorded_baseline(&record_name)),
                    now,
                })),
            };
            if let Ok(decision) = &decision {
                debug!(node = %node_name, rule = %rule_name, satisfied = evaluation.all_satisfied, ?decision, "Evaluated");
            }

            plans.push(Plan {
                rule,
                rule_name,
                record_name,
                previous,
                evaluation,
                decision,
            });
        }

        // two live rules owning one taint would fight over it; neither acts until one is changed.
        // Dry-run rules never write, so they own nothing.
        for i in 0..plans.len() {
            if !plans[i].mutates() {
                continue;
            }
            let owners: Vec<&str> = plans
                .iter()
                .filter(|p| {
                    p.mutates()
                        && p.spec().taint.key == plans[i].spec().taint.key
                        && p.spec().taint.effect == plans[i].spec().taint.effect
                })
                .map(|p| p.rule_name.as_str())
                .collect();
            if owners.len() > 1 {
                let message = format!(
                    "taint {}:{} is managed by more than one rule: {}",
                    plans[i].spec().taint.key,
                    plans[i].spec().taint.effect,
                    owners.join(", ")
                );
                plans[i].decision = Err(message);
            }
        }

        Ok((plans, unmatched))
    }

    /// Writes the evaluation record and the node's entry in the rule status.
    ///
    /// Both writes are best effort: a failed write is logged and surfaced as an error on the next
    /// pass instead of failing a reconciliation whose taint changes are already committed.
    async fn record(
        &self,
        node: &Node,
        plan: &Plan,
        taint_status: TaintStatus,
        failure: Option<Failure>,
        now: DateTime<Utc>,
    ) {
        let node_name = node.name_any();
        let failure = match (failure, self.take_unrecorded(&plan.record_name)) {
            (Some(mut failure), Some(missed)) => {
                failure.count += missed.count;
                Some(failure)
            }
            (failure, missed) => failure.or(missed),
        };

        let status = next_evaluation_status(
            plan.previous.as_ref().and_then(|p| p.status.as_ref()),
            &plan.evaluation,
            taint_status,
            plan.unsatisfied_since(),
            failure.as_ref(),
            now,
        );

        match self.write_evaluation(node, plan, status).await {
            Ok(()) => self.set_unrecorded_baseline(&plan.record_name, None),
            Err(err) => {
                warn!(record = %plan.record_name, "Failed to write evaluation record: {err}");
                self.note_unrecorded(&plan.record_name, "EvaluationNotRecorded", "evaluation", &err);
                self.set_unrecorded_baseline(&plan.record_name, plan.unsatisfied_since());
            }
        }

        let outcome = NodeOutcome {
            node_name: node_name.clone(),
            evaluation: NodeEvaluation {
                node_name: node_name.clone(),
                condition_results: plan.evaluation.results.clone(),
                taint_status,
                last_evaluated: Time(now),
            },
            tainted: taint_status == TaintStatus::Present,
            completed: bootstrap::is_completed(node, &plan.rule_name),
            failure: failure.map(|f| NodeFailure {
                node_name,
                reason: f.reason,
                message: f.message,
                last_updated: Time(now),
            }),
        };
        let updated = self
            .update_rule_status(&plan.rule_name, |status, generation| {
                apply_node_outcome(status, outcome.clone());
                refresh_ready_condition(status, generation, None, now);
                true
            })
            .await;
        if let Err(err) = updated {
            warn!(rule = %plan.rule_name, node = %node.name_any(), "Failed to update rule status: {err}");
            self.note_unrecorded(&plan.record_name, "RuleStatusNotRecorded", "rule status", &err);
        }
    }

    async fn write_evaluation(
        &self,
        node: &Node,
        plan: &Plan,
        status: NodeReadinessEvaluationStatus,
    ) -> Result<()> {
        let rule_generation = plan.rule.generation().unwrap_or_default();

        let Some(previous) = &plan.previous else {
            let node_name = node.name_any();
            let owners = plan
                .rule
                .rule
                .controller_owner_ref(&())
                .into_iter()
                .chain(node_owner_ref(node))
                .collect();
            let record = NodeReadinessEvaluation {
                metadata: ObjectMeta {
                    name: Some(plan.record_name.clone()),
                    labels: Some(BTreeMap::from([
                        (RULE_NAME_LABEL.to_string(), label_value(&plan.rule_name)),
                        (NODE_NAME_LABEL.to_string(), label_value(&node_name)),
                    ])),
                    owner_references: Some(owners),
                    ..Default::default()
                },
                spec: NodeReadinessEvaluationSpec {
                    rule_name: plan.rule_name.clone(),
                    node_name,
                    rule_generation,
                },
                status: Some(status),
            };
            self.store.create_evaluation(&record).await?;
            return Ok(());
        };

        let mut record = previous.clone();
        if record.spec.rule_generation != rule_generation {
            record.spec.rule_generation = rule_generation;
            record = self.store.replace_evaluation(&record).await?;
        }
        record.status = Some(status);
        self.store.replace_evaluation_status(&record).await?;
        Ok(())
    }

    fn take_unrecorded(&self, record_name: &str) -> Option<Failure> {
        self.unrecorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(record_name)
    }

    fn note_unrecorded(&self, record_name: &str, reason: &str, what: &str, err: &Error) {
        let mut unrecorded = self.unrecorded.lock().unwrap_or_else(|e| e.into_inner());
        let entry = unrecorded
            .entry(record_name.to_string())
            .or_insert_with(|| Failure {
                reason: String::new(),
                message: String::new(),
                count: 0,
            });
        entry.reason = reason.into();
        entry.message = format!("previous {what} was not recorded: {err}");
        entry.count += 1;
    }

    fn unrecorded_baseline(&self, record_name: &str) -> Option<DateTime<Utc>> {
        self.baselines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(record_name)
            .copied()
    }

    fn set_unrecorded_baseline(&self, record_name: &str, since: Option<DateTime<Utc>>) {
        let mut baselines = self.baselines.lock().unwrap_or_else(|e| e.into_inner());
        match since {
            Some(since) => baselines.insert(record_name.to_string(), since),
            None => baselines.remove(record_name),
        };
    }

    /// Records a failed reconciliation on every applicable rule. The node's taints were not
    /// converged, so their status is Unknown.
    async fn record_failure(&self, node_name: &str, err: &Error) -> Result<()> {
        let Some(node) = self.store.get_node(node_name).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let (plans, _) = self.plan(&node, now).await?;
        for plan in &plans {
            self.record(&node, plan, TaintStatus::Unknown, Some(Failure::from_error(err)), now)
                .await;
        }
        Ok(())
    }

    /// Drops a deleted node from every rule status and from the in-memory bookkeeping.
    async fn forget_node(&self, node_name: &str) {
        for rule in self.cache.snapshot() {
            let rule_name = rule.name();
            let record_name = evaluation_name(&rule_name, node_name);
            self.take_unrecorded(&record_name);
            self.set_unrecorded_baseline(&record_name, None);
            if let Err(err) = self
                .update_rule_status(&rule_name, |status, _| remove_node(status, node_name))
                .await
            {
                warn!(node = node_name, rule = %rule_name, "Failed to update rule status: {err}");
            }
        }
    }

    /// Read-modify-write of a rule status, retried on conflict. `mutate` returns whether it
    /// changed anything; nothing is written otherwise. A deleted rule is skipped.
    async fn update_rule_status<F>(&self, rule_name: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut NodeReadinessRuleStatus, Option<i64>) -> bool + Send + Sync,
    {
        let mutate = &mutate;
        retry_with_backoff(&self.retry, "update rule status", Error::is_conflict, move || async move {
            let Some(mut rule) = self.store.get_rule(rule_name).await? else {
                return Ok(());
            };
            let mut status = rule.status.take().unwrap_or_default();
            if !mutate(&mut status, rule.metadata.generation) {
                return Ok(());
            }
            rule.status = Some(status);
            match self.store.replace_rule_status(&rule).await {
                Err(err) if err.is_not_found() => Ok(()),
                result => result.map(|_| ()),
            }
        })
        .await
    }

    /// Refreshes the rule cache entry and rebuilds the rule's status from the nodes it matches.
    ///
    /// Nodes are not mutated here; the caller fans the matched nodes out to node reconciliations.
    pub async fn reconcile_rule(&self, rule: &NodeReadinessRule) -> Result<RuleReconcile> {
        let cached = self.cache.upsert(rule.clone());
        let rule_name = rule.name_any();
        let now = Utc::now();

        let selector = match &cached.selector {
            Ok(selector) => selector,
            Err(message) => {
                warn!(rule = %rule_name, "Rule cannot be evaluated: {message}");
                self.update_rule_status(&rule_name, |status, generation| {
                    let folded = fold_rule_status(
                        Some(&*status),
                        generation,
                        vec![],
                        Some(message.as_str()),
                        None,
                        now,
                    );
                    *status = folded;
                    true
                })
                .await?;
                return Ok(RuleReconcile {
                    matched_nodes: vec![],
                    requeue_after: None,
                });
            }
        };

        let nodes = self.store.list_nodes().await?;
        let matched: Vec<&Node> = nodes.iter().filter(|n| matches_node(selector, n)).collect();
        let records: HashMap<String, NodeReadinessEvaluation> = self
            .store
            .list_evaluations(&rule_name)
            .await?
            .into_iter()
            .map(|e| (e.spec.node_name.clone(), e))
            .collect();

        let outcomes: Vec<NodeOutcome> = matched
            .iter()
            .map(|node| {
                let record = records.get(&node.name_any());
                outcome_from_record(&rule_name, &rule.spec, node, record, now)
            })
            .collect();

        let dry_run_results = rule
            .spec
            .dry_run
            .then(|| dryrun::analyze(&rule_name, &rule.spec, matched.iter().copied(), now));
        if let Some(results) = &dry_run_results {
            info!(rule = %rule_name, "Dry run: {}", results.summary);
        }

        self.update_rule_status(&rule_name, |status, generation| {
            let folded = fold_rule_status(
                Some(&*status),
                generation,
                outcomes.clone(),
                None,
                dry_run_results.clone(),
                now,
            );
            *status = folded;
            true
        })
        .await?;

        Ok(RuleReconcile {
            matched_nodes: matched.iter().map(|n| n.name_any()).collect(),
            requeue_after: Some(self.resync),
        })
    }

    /// Removes a deleted rule's taint and completion marker from every node.
    ///
    /// The rule leaves the cache first and each node is cleaned under its lock, so a node
    /// reconciliation that still saw the rule finishes before its node is cleaned.
    pub async fn cleanup_rule(&self, rule: &NodeReadinessRule) -> Result<()> {
        let rule_name = rule.name_any();
        self.cache.remove(&rule_name);

        for node in self.store.list_nodes().await? {
            let name = node.name_any();
            let _guard = self.node_locks.lock(&name).await;
            let (node_name, rule_name) = (name.as_str(), rule_name.as_str());
            retry_with_backoff(&self.retry, "clean up node", Error::is_conflict, move || {
                self.clean_node(node_name, rule_name, rule)
            })
            .await?;
        }
        info!(rule = %rule_name, "Rule cleaned up");
        Ok(())
    }

    async fn clean_node(&self, node_name: &str, rule_name: &str, rule: &NodeReadinessRule) -> Result<()> {
        let Some(mut node) = self.store.get_node(node_name).await? else {
            return Ok(());
        };
        let mut changed = bootstrap::clear_completed(&mut node, rule_name);
        if !rule.spec.dry_run {
            changed |= taints::set_node_taint(&mut node, &rule.spec.taint, false, Utc::now());
        }
        if changed {
            self.store.replace_node(&node).await?;
            info!(node = node_name, rule = rule_name, "Removed taint and completion marker");
        }
        Ok(())
    }
}

fn taint_status(node: &Node, taint: &TaintSpec) -> TaintStatus {
    if taints::node_has_taint(node, taint) {
        TaintStatus::Present
    } else {
        TaintStatus::Absent
    }
}

fn node_owner_ref(node: &Node) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: <Node as k8s_openapi::Resource>::API_VERSION.into(),
        kind: <Node as k8s_openapi::Resource>::KIND.into(),
        name: node.metadata.name.clone()?,
        uid: node.metadata.uid.clone()?,
        ..Default::default()
    })
}

/// The record status after one evaluation. Any failure bumps consecutiveErrors; a clean
/// evaluation resets it and clears the last error.
fn next_evaluation_status(
    previous: Option<&NodeReadinessEvaluationStatus>,
    evaluation: &ConditionEvaluation,
    taint_status: TaintStatus,
    unsatisfied_since: Option<DateTime<Utc>>,
    failure: Option<&Failure>,
    now: DateTime<Utc>,
) -> NodeReadinessEvaluationStatus {
    let mut status = NodeReadinessEvaluationStatus {
        condition_results: evaluation.results.clone(),
        all_conditions_satisfied: evaluation.all_satisfied,
        taint_status,
        last_evaluated: Some(Time(now)),
        evaluation_count: previous.map_or(0, |p| p.evaluation_count) + 1,
        unsatisfied_since: unsatisfied_since.map(Time),
        ..Default::default()
    };
    if let Some(failure) = failure {
        status.last_error = Some(failure.message.clone());
        status.last_error_reason = Some(failure.reason.clone());
        status.last_error_time = Some(Time(now));
        status.consecutive_errors = previous.map_or(0, |p| p.consecutive_errors) + failure.count;
    }
    status
}

/// A matched node's status entry as seen from the rule: current node state plus the last
/// recorded evaluation.
fn outcome_from_record(
    rule_name: &str,
    spec: &NodeReadinessRuleSpec,
    node: &Node,
    record: Option<&NodeReadinessEvaluation>,
    now: DateTime<Utc>,
) -> NodeOutcome {
    let node_name = node.name_any();
    let evaluation = evaluate(node_conditions(node), &spec.conditions);
    let recorded = record.and_then(|r| r.status.as_ref());
    let taint_status = taint_status(node, &spec.taint);

    NodeOutcome {
        evaluation: NodeEvaluation {
            node_name: node_name.clone(),
            condition_results: evaluation.results,
            taint_status,
            last_evaluated: recorded
                .and_then(|s| s.last_evaluated.clone())
                .unwrap_or(Time(now)),
        },
        tainted: taint_status == TaintStatus::Present,
        completed: bootstrap::is_completed(node, rule_name),
        failure: recorded
            .filter(|s| s.consecutive_errors > 0)
            .map(|s| NodeFailure {
                node_name: node_name.clone(),
                reason: s
                    .last_error_reason
                    .clone()
                    .unwrap_or_else(|| "EvaluationFailed".into()),
                message: s.last_error.clone().unwrap_or_default(),
                last_updated: s.last_error_time.clone().unwrap_or(Time(now)),
            }),
        node_name,
    }
}
