use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{
    api::{Api, ResourceExt},
    client::Client,
    runtime::controller::{self, Action, Controller},
};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use super::engine::Engine;
use super::{ensure_deletion_change, Diagnostics, Settings, State};
use crate::readiness::conditions::node_conditions;
use crate::{telemetry, Error, Metrics, Result};

// Context for the node reconciler
#[derive(Clone)]
pub(super) struct Context {
    pub engine: Engine,
    /// Requeue delay after a failed reconciliation
    pub error_requeue: Duration,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

#[instrument(skip(ctx, node), fields(trace_id, node = %node.name_any()))]
async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Node>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = node.name_any();
    debug!("Reconciling Node \"{name}\"");
    match ctx.engine.reconcile_node(&name).await {
        Ok(outcome) => Ok(Action::requeue(
            outcome.requeue_after.unwrap_or_else(|| ctx.engine.resync()),
        )),
        Err(err) => {
            warn!("reconcile of node {name} failed: {:?}", err);
            ctx.metrics.reconcile_failure(node.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_node: Arc<Node>, _error: &Error, ctx: Arc<Context>) -> Action {
    Action::requeue(ctx.error_requeue)
}

// nodes have no generation; only the parts that feed a readiness decision matter
fn node_predicate(node: &Node) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    node.metadata.generation.hash(&mut hasher);
    node.labels().hash(&mut hasher);
    node.annotations().hash(&mut hasher);
    if let Some(taints) = node.spec.as_ref().and_then(|s| s.taints.as_ref()) {
        serde_hashkey::to_key(taints)
            .expect("serde_hashkey never to return an error")
            .hash(&mut hasher);
    }
    // heartbeats move on every kubelet status update, so only type and status count
    for condition in node_conditions(node) {
        condition.type_.hash(&mut hasher);
        condition.status.hash(&mut hasher);
    }
    Some(hasher.finish())
}

/// Builds the node controller. Node references sent on `triggers` are reconciled as if the
/// node itself had changed. Also returns the node store, for readiness reporting.
pub(super) fn controller(
    client: Client,
    engine: Engine,
    metrics: Metrics,
    state: State,
    settings: Settings,
    triggers: UnboundedReceiver<ObjectRef<Node>>,
) -> (impl Future<Output = ()>, Store<Node>) {
    let node_api = Api::<Node>::all(client);

    let (node_store, node_writer) = reflector::store();
    let node_reflector = reflector(node_writer, watcher(node_api, watcher::Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(node_predicate);

    let context = Arc::new(Context {
        engine,
        error_requeue: settings.error_requeue,
        diagnostics: state.diagnostics.clone(),
        metrics,
    });

    let controller = Controller::for_stream(node_reflector, node_store.clone())
        .with_config(controller::Config::default().concurrency(settings.concurrency))
        .reconcile_on(triggers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    (controller, node_store)
}
