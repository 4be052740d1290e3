//! Pod label matching for policy selectors.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, BTreeSet};

pub type Map = BTreeMap<String, String>;

/// A compiled label selector. The results of `matchLabels` and
/// `matchExpressions` are ANDed; an empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    match_labels: Map,
    match_expressions: Vec<Expression>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidSelector {
    #[error("unknown operator {0:?}")]
    UnknownOperator(String),

    #[error("operator {0} requires values")]
    MissingValues(&'static str),

    #[error("operator {0} does not take values")]
    UnexpectedValues(&'static str),
}

impl Selector {
    /// Compiles a Kubernetes `LabelSelector`. An absent selector matches
    /// all pods.
    pub fn from_label_selector(selector: Option<&LabelSelector>) -> Result<Self, InvalidSelector> {
        let Some(selector) = selector else {
            return Ok(Self::default());
        };

        let match_labels = selector.match_labels.clone().unwrap_or_default();

        let mut match_expressions = Vec::new();
        for expr in selector.match_expressions.iter().flatten() {
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            let operator = match expr.operator.as_str() {
                "In" => {
                    if values.is_empty() {
                        return Err(InvalidSelector::MissingValues("In"));
                    }
                    Operator::In
                }
                "NotIn" => {
                    if values.is_empty() {
                        return Err(InvalidSelector::MissingValues("NotIn"));
                    }
                    Operator::NotIn
                }
                "Exists" => {
                    if !values.is_empty() {
                        return Err(InvalidSelector::UnexpectedValues("Exists"));
                    }
                    Operator::Exists
                }
                "DoesNotExist" => {
                    if !values.is_empty() {
                        return Err(InvalidSelector::UnexpectedValues("DoesNotExist"));
                    }
                    Operator::DoesNotExist
                }
                unknown => return Err(InvalidSelector::UnknownOperator(unknown.to_string())),
            };
            match_expressions.push(Expression {
                key: expr.key.clone(),
                operator,
                values,
            });
        }

        Ok(Self {
            match_labels,
            match_expressions,
        })
    }

    pub fn selects_all(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &Map) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }

        self.match_expressions.iter().all(|expr| expr.matches(labels))
    }
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}
