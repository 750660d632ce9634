use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use kube::core::Selector;
use kube::ResourceExt;

use crate::readiness::selector::parse_selector;
use crate::resources::nodereadinessrules::NodeReadinessRule;

/// A rule as seen by node reconciliations, with its selector and grace period already parsed.
///
/// Parse failures are kept as messages so that every node reconciliation can report them
/// without re-parsing.
#[derive(Debug)]
pub struct CachedRule {
    pub rule: NodeReadinessRule,
    pub selector: Result<Selector, String>,
    pub grace_period: Result<Option<Duration>, String>,
}

impl CachedRule {
    pub fn new(rule: NodeReadinessRule) -> Self {
        let name = rule.name_any();
        let selector =
            parse_selector(&name, rule.spec.node_selector.as_ref()).map_err(|e| e.to_string());
        let grace_period = rule.spec.grace_period().map_err(|e| e.to_string());
        Self {
            rule,
            selector,
            grace_period,
        }
    }

    pub fn name(&self) -> String {
        self.rule.name_any()
    }

    pub fn generation(&self) -> Option<i64> {
        self.rule.metadata.generation
    }
}

/// Rules known to the controller, keyed by name.
///
/// Entries are replaced whole, so readers see either the old or the new rule. The lock is
/// never held across an await.
#[derive(Clone, Default)]
pub struct RuleCache {
    rules: Arc<RwLock<BTreeMap<String, Arc<CachedRule>>>>,
}

impl RuleCache {
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<CachedRule>>> {
        self.rules.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<CachedRule>>> {
        self.rules.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts or replaces the rule and returns the cached entry. A copy of the same object
    /// with a lower generation than the cached one is ignored.
    pub fn upsert(&self, rule: NodeReadinessRule) -> Arc<CachedRule> {
        let name = rule.name_any();
        let mut rules = self.write();
        if let Some(existing) = rules.get(&name) {
            if existing.rule.metadata.uid == rule.metadata.uid
                && existing.generation() > rule.metadata.generation
            {
                return existing.clone();
            }
        }
        let cached = Arc::new(CachedRule::new(rule));
        rules.insert(name, cached.clone());
        cached
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CachedRule>> {
        self.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CachedRule>> {
        self.read().get(name).cloned()
    }

    /// All rules, ordered by name
    pub fn snapshot(&self) -> Vec<Arc<CachedRule>> {
        self.read().values().cloned().collect()
    }

    /// Replaces the whole cache with a fresh list from the store.
    pub fn rebuild(&self, rules: impl IntoIterator<Item = NodeReadinessRule>) {
        let fresh: BTreeMap<_, _> = rules
            .into_iter()
            .filter(|r| r.metadata.deletion_timestamp.is_none())
            .map(|r| (r.name_any(), Arc::new(CachedRule::new(r))))
            .collect();
        *self.write() = fresh;
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
