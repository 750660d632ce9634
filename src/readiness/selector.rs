use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};

use crate::{Error, Result};

/// Parses a rule's nodeSelector. An unset selector matches every node.
///
/// Expressions are checked up front so that a selector which can never be evaluated
/// (unknown operator, `In` without values, `Exists` with values) is reported as a
/// configuration error rather than silently matching nothing.
pub fn parse_selector(rule_name: &str, selector: Option<&LabelSelector>) -> Result<Selector> {
    let Some(selector) = selector else {
        return Ok(Selector::default());
    };

    let invalid = |message: String| Error::InvalidSelector {
        rule: rule_name.to_string(),
        message,
    };

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(invalid(format!(
                    "operator {} on key {:?} requires at least one value",
                    expr.operator, expr.key
                )))
            }
            "Exists" | "DoesNotExist" if !values.is_empty() => {
                return Err(invalid(format!(
                    "operator {} on key {:?} does not take values",
                    expr.operator, expr.key
                )))
            }
            "In" | "NotIn" | "Exists" | "DoesNotExist" => {}
            other => {
                return Err(invalid(format!(
                    "unknown operator {other:?} on key {:?}",
                    expr.key
                )))
            }
        }
        if expr.key.is_empty() {
            return Err(invalid("expression with an empty key".into()));
        }
    }

    Selector::try_from(selector.clone()).map_err(|err| invalid(err.to_string()))
}

pub fn matches_labels(selector: &Selector, labels: &BTreeMap<String, String>) -> bool {
    selector.matches(labels)
}

pub fn matches_node(selector: &Selector, node: &Node) -> bool {
    const EMPTY_LABELS: &BTreeMap<String, String> = &BTreeMap::new();

    matches_labels(selector, node.metadata.labels.as_ref().unwrap_or(EMPTY_LABELS))
}
