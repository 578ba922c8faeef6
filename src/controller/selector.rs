//! Label selector evaluation for placement policies.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::error::{Error, Result};

/// Whether `labels` satisfy `selector`. An empty selector matches everything.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(match_expressions) = &selector.match_expressions {
        for expr in match_expressions {
            if !expression_matches(expr, labels)? {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

fn expression_matches(
    expr: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let label_value = labels.get(&expr.key);
    let values = expr.values.as_deref().unwrap_or_default();

    match expr.operator.as_str() {
        "In" => Ok(label_value.is_some_and(|v| values.contains(v))),
        "NotIn" => Ok(label_value.map_or(true, |v| !values.contains(v))),
        "Exists" => Ok(label_value.is_some()),
        "DoesNotExist" => Ok(label_value.is_none()),
        other => Err(Error::validation(format!(
            "label selector operator {other:?} on key {:?} is not supported",
            expr.key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn match_labels_and_expressions_are_anded() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("team", "edge")])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".into(),
                operator: "In".into(),
                values: Some(vec!["web".into(), "api".into()]),
            }]),
        };
        assert!(matches(&selector, &labels(&[("team", "edge"), ("tier", "api")])).unwrap());
        assert!(!matches(&selector, &labels(&[("team", "edge"), ("tier", "db")])).unwrap());
        assert!(!matches(&selector, &labels(&[("tier", "web")])).unwrap());
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(matches(&LabelSelector::default(), &BTreeMap::new()).unwrap());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let selector = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".into(),
                operator: "Gt".into(),
                values: None,
            }]),
            ..Default::default()
        };
        assert!(matches(&selector, &BTreeMap::new()).is_err());
    }
}
