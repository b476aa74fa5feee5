use crate::descriptor::Direction;
use serde::{Deserialize, Serialize};

/// A span of an intent tagged with its role, as produced by the entity
/// classifier.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Entity {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Label,
    PodName,
    Namespace,
    Port,
    Action,
    Policy,
    TrafficDirection,
    Path,
    #[serde(other)]
    Unknown,
}

/// The ordered entities of a single intent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Entities(Vec<Entity>);

pub const DEFAULT_NAMESPACE: &str = "default";

// === impl Entity ===

impl Entity {
    pub fn new(kind: EntityKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

// === impl Entities ===

impl Entities {
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All texts of the given kind, in intent order.
    pub fn all(&self, kind: EntityKind) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(move |e| e.kind == kind)
            .map(|e| e.text.as_str())
    }

    pub fn first(&self, kind: EntityKind) -> Option<&str> {
        self.all(kind).next()
    }

    /// Later entities of a kind supersede earlier ones.
    pub fn last(&self, kind: EntityKind) -> Option<&str> {
        self.all(kind).last()
    }

    pub fn namespace(&self) -> &str {
        self.last(EntityKind::Namespace)
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Egress unless the intent names an inbound direction.
    pub fn direction(&self) -> Direction {
        self.last(EntityKind::TrafficDirection)
            .map(Direction::from_text)
            .unwrap_or(Direction::Egress)
    }

    /// The primary pod name, stripped of a trailing ` pod` qualifier. Blank
    /// names are ignored.
    pub fn pod_name(&self) -> Option<&str> {
        self.all(EntityKind::PodName)
            .map(normalize_pod_name)
            .filter(|name| !name.is_empty())
            .last()
    }

    /// Distinct pod names in the order they first appear.
    pub fn pod_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for name in self.all(EntityKind::PodName).map(normalize_pod_name) {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

impl FromIterator<Entity> for Entities {
    fn from_iter<T: IntoIterator<Item = Entity>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<Entity>> for Entities {
    fn from(entities: Vec<Entity>) -> Self {
        Self(entities)
    }
}

impl IntoIterator for Entities {
    type Item = Entity;
    type IntoIter = std::vec::IntoIter<Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Trims a pod name and drops a trailing ` pod`, e.g. `db pod` becomes `db`.
pub fn normalize_pod_name(text: &str) -> &str {
    let text = text.trim();
    text.strip_suffix(" pod")
        .or_else(|| text.strip_suffix(" Pod"))
        .map(str::trim_end)
        .unwrap_or(text)
}
