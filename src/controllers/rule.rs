use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::channel::mpsc::UnboundedSender;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{
    api::{Api, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
    },
    Resource,
};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use super::engine::Engine;
use super::{ensure_deletion_change, Diagnostics, Settings, State};
use crate::resources::nodereadinessrules::{NodeReadinessRule, NODE_READINESS_RULE_FINALIZER};
use crate::store::FIELD_MANAGER;
use crate::{telemetry, Error, Metrics, Result};

// Context for the rule reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    pub engine: Engine,
    /// Matched nodes are sent here so the node controller re-evaluates them
    pub node_triggers: UnboundedSender<ObjectRef<Node>>,
    /// Requeue delay after a failed reconciliation
    pub error_requeue: Duration,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

#[instrument(skip(ctx, rule), fields(trace_id, rule = %rule.name_any()))]
async fn reconcile(rule: Arc<NodeReadinessRule>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<NodeReadinessRule>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let rules: Api<NodeReadinessRule> = Api::all(ctx.client.clone());

    info!("Reconciling NodeReadinessRule \"{}\"", rule.name_any());
    match finalizer(&rules, NODE_READINESS_RULE_FINALIZER, rule.clone(), |event| async {
        match event {
            Finalizer::Apply(rule) => apply(&rule, &ctx).await,
            Finalizer::Cleanup(rule) => cleanup(&rule, &ctx).await,
        }
    })
    .await
    {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &rule.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(rule.as_ref(), &err);
            Err(err)
        }
    }
}

async fn apply(rule: &NodeReadinessRule, ctx: &Context) -> Result<Action> {
    let outcome = ctx.engine.reconcile_rule(rule).await?;

    for node_name in &outcome.matched_nodes {
        if ctx
            .node_triggers
            .unbounded_send(ObjectRef::new(node_name))
            .is_err()
        {
            // the node controller has shut down
            break;
        }
    }

    Ok(match outcome.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

async fn cleanup(rule: &NodeReadinessRule, ctx: &Context) -> Result<Action> {
    ctx.engine.cleanup_rule(rule).await?;

    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "CleanedUp".into(),
                note: Some(format!(
                    "Removed taint {} and completion markers from all nodes",
                    rule.spec.taint.key
                )),
                action: "Cleanup".into(),
                secondary: None,
            },
            &rule.object_ref(&()),
        )
        .await?;

    Ok(Action::await_change())
}

fn error_policy(_rule: Arc<NodeReadinessRule>, _error: &Error, ctx: Arc<Context>) -> Action {
    Action::requeue(ctx.error_requeue)
}

// status writes are our own and must not retrigger a reconcile
fn rule_predicate(rule: &NodeReadinessRule) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = rule.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    rule.labels().hash(&mut hasher);
    rule.annotations().hash(&mut hasher);
    rule.finalizers().hash(&mut hasher);
    rule.meta()
        .deletion_timestamp
        .as_ref()
        .map(|t| t.0)
        .hash(&mut hasher);
    Some(hasher.finish())
}

/// Builds the rule controller. Also returns the rule store, for readiness reporting.
pub(super) fn controller(
    client: Client,
    engine: Engine,
    metrics: Metrics,
    state: State,
    settings: Settings,
    node_triggers: UnboundedSender<ObjectRef<Node>>,
) -> (impl Future<Output = ()>, Store<NodeReadinessRule>) {
    let rule_api = Api::<NodeReadinessRule>::all(client.clone());

    let (rule_store, rule_writer) = reflector::store();
    let rule_reflector = reflector(rule_writer, watcher(rule_api, watcher::Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(rule_predicate);

    let context = Arc::new(Context {
        client: client.clone(),
        recorder: Recorder::new(client, FIELD_MANAGER.into()),
        engine,
        node_triggers,
        error_requeue: settings.error_requeue,
        diagnostics: state.diagnostics.clone(),
        metrics,
    });

    let controller = Controller::for_stream(rule_reflector, rule_store.clone())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    (controller, rule_store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::nodereadinessrules::NodeReadinessRuleSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn rule() -> NodeReadinessRule {
        NodeReadinessRule {
            metadata: ObjectMeta {
                name: Some("cni".into()),
                generation: Some(1),
                ..Default::default()
            },
            spec: NodeReadinessRuleSpec::default(),
            status: None,
        }
    }

    #[test]
    fn status_changes_are_ignored() {
        let mut with_status = rule();
        with_status.status = Some(Default::default());
        assert_eq!(rule_predicate(&rule()), rule_predicate(&with_status));
    }

    #[test]
    fn spec_finalizer_and_deletion_changes_are_seen() {
        let base = rule();

        let mut bumped = rule();
        bumped.metadata.generation = Some(2);
        assert_ne!(rule_predicate(&base), rule_predicate(&bumped));

        let mut finalized = rule();
        finalized.metadata.finalizers = Some(vec![NODE_READINESS_RULE_FINALIZER.into()]);
        assert_ne!(rule_predicate(&base), rule_predicate(&finalized));

        let mut deleting = rule();
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_ne!(rule_predicate(&base), rule_predicate(&deleting));
    }
}
