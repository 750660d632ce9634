use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::ResourceExt;
use serde_json::json;

use crate::resources::nodereadinessevaluations::{label_value, NodeReadinessEvaluation, RULE_NAME_LABEL};
use crate::resources::nodereadinessrules::NodeReadinessRule;
use crate::{Error, Result};

pub const FIELD_MANAGER: &str = "node-readiness-controller";

/// Reads and version-conditioned writes against the cluster.
///
/// Every write carries the resourceVersion of the object it was derived from and fails with a
/// 409 `Conflict` (see [`Error::is_conflict`]) when the stored object has moved on.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    /// Writes the whole node, taints and annotations included, in one request.
    async fn replace_node(&self, node: &Node) -> Result<Node>;

    async fn get_rule(&self, name: &str) -> Result<Option<NodeReadinessRule>>;
    async fn list_rules(&self) -> Result<Vec<NodeReadinessRule>>;
    /// Overwrites the status subresource with `rule.status`.
    async fn replace_rule_status(&self, rule: &NodeReadinessRule) -> Result<NodeReadinessRule>;

    async fn get_evaluation(&self, name: &str) -> Result<Option<NodeReadinessEvaluation>>;
    async fn list_evaluations(&self, rule_name: &str) -> Result<Vec<NodeReadinessEvaluation>>;
    /// Creates the record, status included. Fails with 409 `AlreadyExists` if it exists.
    async fn create_evaluation(
        &self,
        evaluation: &NodeReadinessEvaluation,
    ) -> Result<NodeReadinessEvaluation>;
    /// Writes metadata and spec; status is ignored.
    async fn replace_evaluation(
        &self,
        evaluation: &NodeReadinessEvaluation,
    ) -> Result<NodeReadinessEvaluation>;
    /// Overwrites the status subresource with `evaluation.status`.
    async fn replace_evaluation_status(
        &self,
        evaluation: &NodeReadinessEvaluation,
    ) -> Result<NodeReadinessEvaluation>;
}

/// [`ClusterStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        }
    }
}

fn name_of<K: kube::Resource>(obj: &K) -> Result<&str> {
    obj.meta()
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))
}

/// A merge patch replacing the status, rejected if the object's resourceVersion moved on.
fn status_patch<S: serde::Serialize>(
    resource_version: Option<String>,
    status: &Option<S>,
) -> Patch<serde_json::Value> {
    Patch::Merge(json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    }))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get_opt(name).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await?.items)
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes
            .replace(name_of(node)?, &Self::post_params(), node)
            .await?)
    }

    async fn get_rule(&self, name: &str) -> Result<Option<NodeReadinessRule>> {
        let rules: Api<NodeReadinessRule> = Api::all(self.client.clone());
        Ok(rules.get_opt(name).await?)
    }

    async fn list_rules(&self) -> Result<Vec<NodeReadinessRule>> {
        let rules: Api<NodeReadinessRule> = Api::all(self.client.clone());
        Ok(rules.list(&ListParams::default()).await?.items)
    }

    async fn replace_rule_status(&self, rule: &NodeReadinessRule) -> Result<NodeReadinessRule> {
        let rules: Api<NodeReadinessRule> = Api::all(self.client.clone());
        Ok(rules
            .patch_status(
                name_of(rule)?,
                &Self::patch_params(),
                &status_patch(rule.resource_version(), &rule.status),
            )
            .await?)
    }

    async fn get_evaluation(&self, name: &str) -> Result<Option<NodeReadinessEvaluation>> {
        let evaluations: Api<NodeReadinessEvaluation> = Api::all(self.client.clone());
        Ok(evaluations.get_opt(name).await?)
    }

    async fn list_evaluations(&self, rule_name: &str) -> Result<Vec<NodeReadinessEvaluation>> {
        let evaluations: Api<NodeReadinessEvaluation> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&format!("{RULE_NAME_LABEL}={}", label_value(rule_name)));
        Ok(evaluations
            .list(&lp)
            .await?
            .items
            .into_iter()
            // hashed label values can collide
            .filter(|e| e.spec.rule_name == rule_name)
            .collect())
    }

    async fn create_evaluation(
        &self,
        evaluation: &NodeReadinessEvaluation,
    ) -> Result<NodeReadinessEvaluation> {
        let evaluations: Api<NodeReadinessEvaluation> = Api::all(self.client.clone());
        let created = evaluations
            .create(&Self::post_params(), evaluation)
            .await?;
        if evaluation.status.is_none() {
            return Ok(created);
        }
        // create ignores the status subresource
        Ok(evaluations
            .patch_status(
                name_of(&created)?,
                &Self::patch_params(),
                &status_patch(created.resource_version(), &evaluation.status),
            )
            .await?)
    }

    async fn replace_evaluation(
        &self,
        evaluation: &NodeReadinessEvaluation,
    ) -> Result<NodeReadinessEvaluation> {
        let evaluations: Api<NodeReadinessEvaluation> = Api::all(self.client.clone());
        Ok(evaluations
            .replace(name_of(evaluation)?, &Self::post_params(), evaluation)
            .await?)
    }

    async fn replace_evaluation_status(
        &self,
        evaluation: &NodeReadinessEvaluation,
    ) -> Result<NodeReadinessEvaluation> {
        let evaluations: Api<NodeReadinessEvaluation> = Api::all(self.client.clone());
        Ok(evaluations
            .patch_status(
                name_of(evaluation)?,
                &Self::patch_params(),
                &status_patch(evaluation.resource_version(), &evaluation.status),
            )
            .await?)
    }
}

/// In-memory [`ClusterStore`] with API-server write semantics, for engine tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use kube::error::ErrorResponse;

    use super::*;

    #[derive(Default)]
    struct Objects {
        version: u64,
        nodes: BTreeMap<String, Node>,
        rules: BTreeMap<String, NodeReadinessRule>,
        evaluations: BTreeMap<String, NodeReadinessEvaluation>,
    }

    impl Objects {
        fn next_version(&mut self) -> String {
            self.version += 1;
            self.version.to_string()
        }
    }

    #[derive(Default)]
    pub struct FakeStore {
        objects: Mutex<Objects>,
        node_writes: AtomicUsize,
        node_conflicts: AtomicUsize,
        rule_status_writes: AtomicUsize,
        injected_node_conflicts: AtomicUsize,
        injected_rule_status_conflicts: AtomicUsize,
        node_write_delay: Mutex<Option<Duration>>,
        fail_evaluation_writes: Mutex<bool>,
    }

    pub fn api_error(code: u16, reason: &str) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("fake {reason}"),
            reason: reason.into(),
            code,
        }))
    }

    fn conflict() -> Error {
        api_error(409, "Conflict")
    }

    fn check_version(stored: Option<&String>, incoming: Option<&String>) -> Result<()> {
        match incoming {
            Some(v) if Some(v) != stored => Err(conflict()),
            _ => Ok(()),
        }
    }

    impl FakeStore {
        fn objects(&self) -> std::sync::MutexGuard<'_, Objects> {
            self.objects.lock().unwrap()
        }

        pub fn insert_node(&self, mut node: Node) {
            let mut objects = self.objects();
            node.metadata.resource_version = Some(objects.next_version());
            objects.nodes.insert(node.name_any(), node);
        }

        pub fn remove_node(&self, name: &str) {
            self.objects().nodes.remove(name);
        }

        pub fn node(&self, name: &str) -> Node {
            self.objects().nodes[name].clone()
        }

        /// Simulates the kubelet reporting a condition status.
        pub fn set_condition(&self, node_name: &str, type_: &str, status: &str) {
            let mut objects = self.objects();
            let version = objects.next_version();
            let node = objects.nodes.get_mut(node_name).unwrap();
            let conditions = node
                .status
                .get_or_insert_with(NodeStatus::default)
                .conditions
                .get_or_insert_with(Vec::new);
            conditions.retain(|c| c.type_ != type_);
            conditions.push(NodeCondition {
                type_: type_.into(),
                status: status.into(),
                ..Default::default()
            });
            node.metadata.resource_version = Some(version);
        }

        /// Simulates another writer touching the node.
        pub fn bump_node(&self, name: &str) {
            let mut objects = self.objects();
            let version = objects.next_version();
            objects.nodes.get_mut(name).unwrap().metadata.resource_version = Some(version);
        }

        pub fn insert_rule(&self, mut rule: NodeReadinessRule) {
            let mut objects = self.objects();
            rule.metadata.resource_version = Some(objects.next_version());
            let name = rule.name_any();
            rule.metadata.uid.get_or_insert_with(|| format!("uid-{name}"));
            rule.metadata.generation.get_or_insert(1);
            objects.rules.insert(name, rule);
        }

        pub fn rule(&self, name: &str) -> NodeReadinessRule {
            self.objects().rules[name].clone()
        }

        pub fn evaluation(&self, name: &str) -> Option<NodeReadinessEvaluation> {
            self.objects().evaluations.get(name).cloned()
        }

        pub fn evaluation_count(&self) -> usize {
            self.objects().evaluations.len()
        }

        pub fn node_writes(&self) -> usize {
            self.node_writes.load(Ordering::SeqCst)
        }

        pub fn node_conflicts(&self) -> usize {
            self.node_conflicts.load(Ordering::SeqCst)
        }

        pub fn rule_status_writes(&self) -> usize {
            self.rule_status_writes.load(Ordering::SeqCst)
        }

        /// The next `n` node writes fail with a conflict.
        pub fn inject_node_conflicts(&self, n: usize) {
            self.injected_node_conflicts.store(n, Ordering::SeqCst);
        }

        /// The next `n` rule status writes fail with a conflict.
        pub fn inject_rule_status_conflicts(&self, n: usize) {
            self.injected_rule_status_conflicts.store(n, Ordering::SeqCst);
        }

        /// Node writes sleep before committing, widening the read-modify-write window.
        pub fn set_node_write_delay(&self, delay: Duration) {
            *self.node_write_delay.lock().unwrap() = Some(delay);
        }

        pub fn fail_evaluation_writes(&self, fail: bool) {
            *self.fail_evaluation_writes.lock().unwrap() = fail;
        }

        fn evaluation_write_guard(&self) -> Result<()> {
            if *self.fail_evaluation_writes.lock().unwrap() {
                return Err(api_error(500, "InternalError"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterStore for FakeStore {
        async fn get_node(&self, name: &str) -> Result<Option<Node>> {
            Ok(self.objects().nodes.get(name).cloned())
        }

        async fn list_nodes(&self) -> Result<Vec<Node>> {
            Ok(self.objects().nodes.values().cloned().collect())
        }

        async fn replace_node(&self, node: &Node) -> Result<Node> {
            let delay = *self.node_write_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let injected = self
                .injected_node_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if injected.is_ok() {
                self.node_conflicts.fetch_add(1, Ordering::SeqCst);
                return Err(conflict());
            }

            let mut objects = self.objects();
            let name = name_of(node)?.to_string();
            let Some(stored) = objects.nodes.get(&name) else {
                return Err(api_error(404, "NotFound"));
            };
            if let Err(err) = check_version(
                stored.metadata.resource_version.as_ref(),
                node.metadata.resource_version.as_ref(),
            ) {
                self.node_conflicts.fetch_add(1, Ordering::SeqCst);
                return Err(err);
            }

            let mut node = node.clone();
            node.metadata.resource_version = Some(objects.next_version());
            objects.nodes.insert(name, node.clone());
            self.node_writes.fetch_add(1, Ordering::SeqCst);
            Ok(node)
        }

        async fn get_rule(&self, name: &str) -> Result<Option<NodeReadinessRule>> {
            Ok(self.objects().rules.get(name).cloned())
        }

        async fn list_rules(&self) -> Result<Vec<NodeReadinessRule>> {
            Ok(self.objects().rules.values().cloned().collect())
        }

        async fn replace_rule_status(&self, rule: &NodeReadinessRule) -> Result<NodeReadinessRule> {
            let injected = self
                .injected_rule_status_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if injected.is_ok() {
                return Err(conflict());
            }

            let mut objects = self.objects();
            let name = name_of(rule)?.to_string();
            let Some(stored) = objects.rules.get(&name) else {
                return Err(api_error(404, "NotFound"));
            };
            check_version(
                stored.metadata.resource_version.as_ref(),
                rule.metadata.resource_version.as_ref(),
            )?;

            let mut updated = stored.clone();
            updated.status = rule.status.clone();
            updated.metadata.resource_version = Some(objects.next_version());
            objects.rules.insert(name, updated.clone());
            self.rule_status_writes.fetch_add(1, Ordering::SeqCst);
            Ok(updated)
        }

        async fn get_evaluation(&self, name: &str) -> Result<Option<NodeReadinessEvaluation>> {
            Ok(self.objects().evaluations.get(name).cloned())
        }

        async fn list_evaluations(&self, rule_name: &str) -> Result<Vec<NodeReadinessEvaluation>> {
            Ok(self
                .objects()
                .evaluations
                .values()
                .filter(|e| e.spec.rule_name == rule_name)
                .cloned()
                .collect())
        }

        async fn create_evaluation(
            &self,
            evaluation: &NodeReadinessEvaluation,
        ) -> Result<NodeReadinessEvaluation> {
            self.evaluation_write_guard()?;
            let mut objects = self.objects();
            let name = name_of(evaluation)?.to_string();
            if objects.evaluations.contains_key(&name) {
                return Err(api_error(409, "AlreadyExists"));
            }
            let mut created = evaluation.clone();
            created.metadata.resource_version = Some(objects.next_version());
            objects.evaluations.insert(name, created.clone());
            Ok(created)
        }

        async fn replace_evaluation(
            &self,
            evaluation: &NodeReadinessEvaluation,
        ) -> Result<NodeReadinessEvaluation> {
            self.evaluation_write_guard()?;
            let mut objects = self.objects();
            let name = name_of(evaluation)?.to_string();
            let Some(stored) = objects.evaluations.get(&name) else {
                return Err(api_error(404, "NotFound"));
            };
            check_version(
                stored.metadata.resource_version.as_ref(),
                evaluation.metadata.resource_version.as_ref(),
            )?;

            let mut updated = evaluation.clone();
            updated.status = stored.status.clone();
            updated.metadata.resource_version = Some(objects.next_version());
            objects.evaluations.insert(name, updated.clone());
            Ok(updated)
        }

        async fn replace_evaluation_status(
            &self,
            evaluation: &NodeReadinessEvaluation,
        ) -> Result<NodeReadinessEvaluation> {
            self.evaluation_write_guard()?;
            let mut objects = self.objects();
            let name = name_of(evaluation)?.to_string();
            let Some(stored) = objects.evaluations.get(&name) else {
                return Err(api_error(404, "NotFound"));
            };
            check_version(
                stored.metadata.resource_version.as_ref(),
                evaluation.metadata.resource_version.as_ref(),
            )?;

            let mut updated = stored.clone();
            updated.status = evaluation.status.clone();
            updated.metadata.resource_version = Some(objects.next_version());
            objects.evaluations.insert(name, updated.clone());
            Ok(updated)
        }
    }

    #[tokio::test]
    async fn stale_node_writes_conflict() {
        let store = FakeStore::default();
        store.insert_node(Node {
            metadata: kube::api::ObjectMeta {
                name: Some("n".into()),
                ..Default::default()
            },
            ..Default::default()
        });

        let stale = store.get_node("n").await.unwrap().unwrap();
        store.bump_node("n");

        let err = store.replace_node(&stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.node_conflicts(), 1);

        let fresh = store.get_node("n").await.unwrap().unwrap();
        store.replace_node(&fresh).await.unwrap();
        assert_eq!(store.node_writes(), 1);
    }

    #[tokio::test]
    async fn duplicate_evaluations_are_not_conflicts() {
        let store = FakeStore::default();
        let evaluation = NodeReadinessEvaluation {
            metadata: kube::api::ObjectMeta {
                name: Some("r.n".into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        };
        store.create_evaluation(&evaluation).await.unwrap();
        let err = store.create_evaluation(&evaluation).await.unwrap_err();
        assert!(!err.is_conflict());
    }
}
