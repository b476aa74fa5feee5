use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
}

/// Selects a set of pods by label.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_expressions: Option<Expressions>,
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn match_labels(&self) -> Option<&Map> {
        self.match_labels.as_ref()
    }

    /// An empty selector matches every pod in a namespace.
    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().map_or(true, |m| m.is_empty())
            && self.match_expressions.as_ref().map_or(true, |e| e.is_empty())
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Labels ===

impl Labels {
    /// Drops labels that vary between replicas of the same workload.
    pub fn without_volatile(&self) -> Self {
        self.0
            .iter()
            .filter(|(k, _)| !crate::VOLATILE_LABELS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The first non-volatile label, in key order.
    pub fn first(&self) -> Option<(&str, &str)> {
        self.0
            .iter()
            .find(|(k, _)| !crate::VOLATILE_LABELS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every `selector` pair is present in these labels. An empty
    /// selector never matches, since it would select the whole namespace.
    pub fn contains_all(&self, selector: &Map) -> bool {
        !selector.is_empty() && selector.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    /// Renders each label as `'key: value'`, comma separated.
    pub fn quoted(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("'{k}: {v}'"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.0.iter() {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

// === Expression ===

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => {
                if let Some(v) = labels.get(&self.key) {
                    return self.values.contains(v);
                }
            }
            Operator::NotIn => {
                return match labels.get(&self.key) {
                    Some(v) => !self.values.contains(v),
                    None => true,
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("app", "db"))),
                Labels::from_iter(Some(("app", "db"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("app", "db"))),
                Labels::from_iter(vec![("app", "db"), ("tier", "data")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("app", "db"))),
                Labels::from_iter(Some(("app", "web"))),
                false,
                "value mismatch",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "app".into(),
                    operator: Operator::In,
                    values: Some("db".to_string()).into_iter().collect(),
                })),
                Labels::from_iter(vec![("app", "db"), ("tier", "data")]),
                true,
                "expression match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "app".into(),
                    operator: Operator::NotIn,
                    values: Some("db".to_string()).into_iter().collect(),
                })),
                Labels::from_iter(Some(("app", "db"))),
                false,
                "negated expression",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn volatile_labels_are_skipped() {
        let labels = Labels::from_iter(vec![("pod-template-hash", "5d8f"), ("app", "db")]);
        assert_eq!(labels.first(), Some(("app", "db")));
        assert_eq!(labels.without_volatile(), Labels::from_iter(Some(("app", "db"))));
    }

    #[test]
    fn empty_selector_never_contained() {
        let labels = Labels::from_iter(Some(("app", "db")));
        assert!(!labels.contains_all(&Map::new()));
        assert!(labels.contains_all(&maplit::btreemap! {"app".into() => "db".into()}));
    }

    #[test]
    fn quoted_labels() {
        let labels = Labels::from_iter(vec![("app", "db"), ("tier", "data")]);
        assert_eq!(labels.quoted(), "'app: db', 'tier: data'");
        assert_eq!(labels.to_string(), "app=db,tier=data");
    }
}
