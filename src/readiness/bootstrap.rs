use k8s_openapi::api::core::v1::Node;

use crate::resources::bounded_name;

const ANNOTATION_PREFIX: &str = "readiness.k8s.io/";
const COMPLETED_NAME_PREFIX: &str = "bootstrap-completed-";

/// Node annotation recording that a bootstrap-only rule finished enforcement on the node.
///
/// The name part of an annotation key is capped at 63 characters; long rule names are hashed to fit.
pub fn completion_annotation(rule_name: &str) -> String {
    format!(
        "{ANNOTATION_PREFIX}{}",
        bounded_name(format!("{COMPLETED_NAME_PREFIX}{rule_name}"), 63)
    )
}

pub fn is_completed(node: &Node, rule_name: &str) -> bool {
    node.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(&completion_annotation(rule_name)))
}

/// Sets the marker on a node object in place. Returns whether the node changed.
pub fn mark_completed(node: &mut Node, rule_name: &str) -> bool {
    if is_completed(node, rule_name) {
        return false;
    }
    node.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(completion_annotation(rule_name), "true".into());
    true
}

/// Drops the marker; only used when the owning rule is deleted.
pub fn clear_completed(node: &mut Node, rule_name: &str) -> bool {
    node.metadata
        .annotations
        .as_mut()
        .and_then(|a| a.remove(&completion_annotation(rule_name)))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_key() {
        assert_eq!(
            completion_annotation("test-rule"),
            "readiness.k8s.io/bootstrap-completed-test-rule"
        );
    }

    #[test]
    fn long_rule_names_fit_the_annotation_name_limit() {
        let key = completion_annotation(&"r".repeat(200));
        let name = key.strip_prefix(ANNOTATION_PREFIX).unwrap();
        assert!(name.len() <= 63);
    }

    #[test]
    fn mark_is_idempotent() {
        let mut node = Node::default();
        assert!(!is_completed(&node, "cni"));
        assert!(mark_completed(&mut node, "cni"));
        assert!(!mark_completed(&mut node, "cni"));
        assert!(is_completed(&node, "cni"));
        assert!(!is_completed(&node, "other"));
    }

    #[test]
    fn clear() {
        let mut node = Node::default();
        assert!(!clear_completed(&mut node, "cni"));
        mark_completed(&mut node, "cni");
        assert!(clear_completed(&mut node, "cni"));
        assert!(!is_completed(&node, "cni"));
    }
}
