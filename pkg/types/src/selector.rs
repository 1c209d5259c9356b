use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Label selector over namespace labels. A selector matches when every
/// `match_labels` entry and every expression is satisfied. An empty selector
/// matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Check structural validity. `In`/`NotIn` require at least one value;
    /// `Exists`/`DoesNotExist` must not carry values.
    pub fn validate(&self) -> anyhow::Result<()> {
        for req in &self.match_expressions {
            if req.key.is_empty() {
                bail!("selector expression has empty key");
            }
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn => {
                    if req.values.is_empty() {
                        bail!(
                            "selector expression on '{}' uses {:?} with no values",
                            req.key,
                            req.operator
                        );
                    }
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist => {
                    if !req.values.is_empty() {
                        bail!(
                            "selector expression on '{}' uses {:?} with values",
                            req.key,
                            req.operator
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
        for req in &self.match_expressions {
            let found = labels.get(&req.key);
            let ok = match req.operator {
                SelectorOperator::In => found.is_some_and(|v| req.values.contains(v)),
                SelectorOperator::NotIn => !found.is_some_and(|v| req.values.contains(v)),
                SelectorOperator::Exists => found.is_some(),
                SelectorOperator::DoesNotExist => found.is_none(),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = LabelSelector::default();
        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("team", "payments")])));
    }

    #[test]
    fn match_labels_exact() {
        let sel = LabelSelector {
            match_labels: labels(&[("team", "payments")]),
            ..Default::default()
        };
        assert!(sel.matches(&labels(&[("team", "payments"), ("env", "prod")])));
        assert!(!sel.matches(&labels(&[("team", "search")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn expressions() {
        let sel = LabelSelector {
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "env".to_string(),
                    operator: SelectorOperator::In,
                    values: vec!["prod".to_string(), "staging".to_string()],
                },
                LabelSelectorRequirement {
                    key: "legacy".to_string(),
                    operator: SelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
            ..Default::default()
        };
        assert!(sel.matches(&labels(&[("env", "prod")])));
        assert!(!sel.matches(&labels(&[("env", "dev")])));
        assert!(!sel.matches(&labels(&[("env", "prod"), ("legacy", "1")])));
    }

    #[test]
    fn validate_rejects_empty_in() {
        let sel = LabelSelector {
            match_expressions: vec![LabelSelectorRequirement {
                key: "env".to_string(),
                operator: SelectorOperator::In,
                values: vec![],
            }],
            ..Default::default()
        };
        assert!(sel.validate().is_err());
    }
}
