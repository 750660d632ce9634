use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use kube::client::Client;
use kube::Resource;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::store::KubeStore;
use crate::Metrics;

use self::engine::Engine;

pub mod engine;
pub mod node;
pub mod rule;
pub mod rule_cache;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Tunables for the reconciliation engine and its controllers
#[derive(Clone, Debug)]
pub struct Settings {
    /// Immediate retries after a version conflict, before handing back to the controller
    pub max_conflict_retries: u32,
    /// Requeue delay after a failed reconciliation
    pub error_requeue: Duration,
    /// Requeue delay in steady state, so evaluation records stay fresh
    pub resync: Duration,
    /// Concurrent node reconciliations; 0 is unbounded
    pub concurrency: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            error_requeue: Duration::from_secs(30),
            resync: Duration::from_secs(5 * 60),
            concurrency: 0,
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Set once the node and rule watchers have completed their initial list
    ready: Arc<AtomicBool>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn set_ready(&self) {
        self.ready.store(true, Ordering::Release)
    }
}

// deletion doesn't lead to any change in metadata otherwise, which means the predicates
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

/// Runs the rule and node controllers until shutdown.
pub async fn run(client: Client, state: State, settings: Settings) {
    let metrics = match Metrics::default().register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Could not register metrics: {e:?}");
            std::process::exit(1);
        }
    };
    let engine = Engine::new(
        Arc::new(KubeStore::new(client.clone())),
        &settings,
        metrics.clone(),
    );

    if let Err(e) = engine.rebuild_rule_cache().await {
        error!("NodeReadinessRule is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // rule reconciliations hand their matched nodes to the node controller
    let (fanout_tx, fanout_rx) = mpsc::unbounded();

    let (rule_controller, rule_store) = rule::controller(
        client.clone(),
        engine.clone(),
        metrics.clone(),
        state.clone(),
        settings.clone(),
        fanout_tx,
    );
    let (node_controller, node_store) = node::controller(
        client,
        engine,
        metrics,
        state.clone(),
        settings,
        fanout_rx,
    );

    let readiness = {
        let state = state.clone();
        async move {
            if node_store.wait_until_ready().await.is_ok()
                && rule_store.wait_until_ready().await.is_ok()
            {
                info!("Initial sync of nodes and rules complete");
                state.set_ready();
            }
        }
    };

    tokio::join!(rule_controller, node_controller, readiness);
}
