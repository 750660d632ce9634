use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::resources::nodereadinessrules::{TaintEffect, TaintSpec};

pub fn node_taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or_default()
}

// Identical taints are the ones sharing key and effect; the API server rejects a second one.
pub fn has_taint(taints: &[Taint], key: &str, effect: TaintEffect) -> bool {
    taints
        .iter()
        .any(|t| t.key == key && t.effect == effect.as_str())
}

pub fn node_has_taint(node: &Node, taint: &TaintSpec) -> bool {
    has_taint(node_taints(node), &taint.key, taint.effect)
}

/// Adds the taint unless one with the same key and effect is already present. Returns whether anything changed.
pub fn add_taint(taints: &mut Vec<Taint>, taint: &TaintSpec, now: DateTime<Utc>) -> bool {
    if has_taint(taints, &taint.key, taint.effect) {
        return false;
    }
    taints.push(Taint {
        key: taint.key.clone(),
        effect: taint.effect.as_str().to_string(),
        value: taint.value.clone().filter(|v| !v.is_empty()),
        time_added: Some(Time(now)),
    });
    true
}

/// Removes every taint with the given key and effect. Returns whether anything changed.
pub fn remove_taint(taints: &mut Vec<Taint>, key: &str, effect: TaintEffect) -> bool {
    let before = taints.len();
    taints.retain(|t| !(t.key == key && t.effect == effect.as_str()));
    taints.len() != before
}

/// Sets or clears the taint on a node object in place. Returns whether the node changed.
pub fn set_node_taint(node: &mut Node, taint: &TaintSpec, present: bool, now: DateTime<Utc>) -> bool {
    let spec = node.spec.get_or_insert_with(Default::default);
    let mut taints = spec.taints.take().unwrap_or_default();
    let changed = if present {
        add_taint(&mut taints, taint, now)
    } else {
        remove_taint(&mut taints, &taint.key, taint.effect)
    };
    spec.taints = if taints.is_empty() { None } else { Some(taints) };
    changed
}

/// Order-independent comparison of two taint lists by key, effect and value. `timeAdded` is ignored.
pub fn taints_equal(a: &[Taint], b: &[Taint]) -> bool {
    fn as_map(taints: &[Taint]) -> BTreeMap<(&str, &str), &str> {
        taints
            .iter()
            .map(|t| {
                (
                    (t.key.as_str(), t.effect.as_str()),
                    t.value.as_deref().unwrap_or_default(),
                )
            })
            .collect()
    }

    a.len() == b.len() && as_map(a) == as_map(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;

    fn taint(key: &str, effect: &str, value: Option<&str>) -> Taint {
        Taint {
            key: key.into(),
            effect: effect.into(),
            value: value.map(Into::into),
            time_added: None,
        }
    }

    fn spec(key: &str, effect: TaintEffect) -> TaintSpec {
        TaintSpec {
            key: key.into(),
            effect,
            value: None,
        }
    }

    #[test]
    fn has_taint_matches_key_and_effect_only() {
        let taints = vec![taint("k", "NoSchedule", Some("anything"))];
        assert!(has_taint(&taints, "k", TaintEffect::NoSchedule));
        assert!(!has_taint(&taints, "k", TaintEffect::NoExecute));
        assert!(!has_taint(&taints, "other", TaintEffect::NoSchedule));
    }

    #[test]
    fn add_is_idempotent() {
        let now = Utc::now();
        let mut taints = vec![];
        let rule_taint = TaintSpec {
            value: Some("pending".into()),
            ..spec("k", TaintEffect::NoSchedule)
        };

        assert!(add_taint(&mut taints, &rule_taint, now));
        assert!(!add_taint(&mut taints, &rule_taint, now));
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].value.as_deref(), Some("pending"));
        assert_eq!(taints[0].time_added, Some(Time(now)));
    }

    #[test]
    fn add_keeps_existing_value() {
        let mut taints = vec![taint("k", "NoSchedule", Some("old"))];
        let rule_taint = TaintSpec {
            value: Some("new".into()),
            ..spec("k", TaintEffect::NoSchedule)
        };
        assert!(!add_taint(&mut taints, &rule_taint, Utc::now()));
        assert_eq!(taints[0].value.as_deref(), Some("old"));
    }

    #[test]
    fn remove_is_idempotent_and_leaves_other_taints() {
        let mut taints = vec![
            taint("k", "NoSchedule", None),
            taint("k", "NoExecute", None),
            taint("other", "NoSchedule", None),
        ];
        assert!(remove_taint(&mut taints, "k", TaintEffect::NoSchedule));
        assert!(!remove_taint(&mut taints, "k", TaintEffect::NoSchedule));
        assert_eq!(
            taints,
            vec![taint("k", "NoExecute", None), taint("other", "NoSchedule", None)]
        );
    }

    #[test]
    fn set_node_taint_handles_missing_spec() {
        let mut node = Node::default();
        let rule_taint = spec("k", TaintEffect::NoSchedule);

        assert!(set_node_taint(&mut node, &rule_taint, true, Utc::now()));
        assert!(node_has_taint(&node, &rule_taint));
        assert!(set_node_taint(&mut node, &rule_taint, false, Utc::now()));
        assert!(!node_has_taint(&node, &rule_taint));
        assert_eq!(node.spec, Some(NodeSpec::default()));
    }

    #[test]
    fn compares_taints() {
        let taint1 = vec![
            taint("key1", "NoSchedule", Some("value1")),
            taint("key2", "NoExecute", Some("value2")),
        ];
        let taint2 = vec![
            taint("key2", "NoExecute", Some("value2")),
            taint("key1", "NoSchedule", Some("value1")),
        ];
        let taint3 = vec![
            taint("key1", "NoSchedule", Some("different")),
            taint("key2", "NoExecute", Some("value2")),
        ];
        let taint4 = vec![taint("key1", "NoSchedule", Some("value1"))];

        assert!(taints_equal(&taint1, &taint2), "order should not matter");
        assert!(!taints_equal(&taint1, &taint3), "different value");
        assert!(!taints_equal(&taint1, &taint4), "different length");
    }

    #[test]
    fn empty_value_equals_no_value() {
        assert!(taints_equal(
            &[taint("k", "NoSchedule", Some(""))],
            &[taint("k", "NoSchedule", None)]
        ));
    }
}
