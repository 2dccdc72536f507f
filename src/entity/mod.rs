use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[cfg(test)]
mod tests;

/// Catalog entity as produced by the mapper and stored by the catalog.
///
/// Only `title`, `team`, `properties` and `relations` are owned by the
/// mapping; anything else the catalog adds is ignored when diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub blueprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<Value>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationTarget>,
    /// Ownership tag. `None` for stubs and entities created outside the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<String>,
}

/// Value of a relation: one target identifier or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationTarget {
    One(String),
    Many(Vec<String>),
}

impl RelationTarget {
    pub fn identifiers(&self) -> Vec<&str> {
        match self {
            RelationTarget::One(id) => vec![id.as_str()],
            RelationTarget::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }

    /// Keep only the identifiers accepted by `keep`. A dropped single
    /// relation yields `None`; a many-relation may end up empty.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> Option<RelationTarget> {
        match self {
            RelationTarget::One(id) => keep(id).then(|| self.clone()),
            RelationTarget::Many(ids) => {
                let kept: Vec<String> = ids.iter().filter(|id| keep(id)).cloned().collect();
                Some(RelationTarget::Many(kept))
            }
        }
    }
}

/// (blueprint, identifier) pair that names one entity in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub blueprint: String,
    pub identifier: String,
}

impl EntityRef {
    pub fn new(blueprint: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            blueprint: blueprint.into(),
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.blueprint, self.identifier)
    }
}

/// Ownership scope of a reconciliation: entities written by one
/// integration instance for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityScope {
    pub datasource: String,
    pub kind: String,
}

impl EntityScope {
    pub fn new(datasource: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            datasource: datasource.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.datasource, self.kind)
    }
}

impl Entity {
    pub fn new(identifier: impl Into<String>, blueprint: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: None,
            blueprint: blueprint.into(),
            team: None,
            properties: BTreeMap::new(),
            relations: BTreeMap::new(),
            datasource: None,
        }
    }

    /// Empty, unowned entity standing in for a missing relation target.
    pub fn stub(entity_ref: &EntityRef) -> Self {
        Self::new(entity_ref.identifier.clone(), entity_ref.blueprint.clone())
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.blueprint.clone(), self.identifier.clone())
    }

    /// Copy without relations, written first when relations form a cycle.
    pub fn placeholder(&self) -> Self {
        Self {
            relations: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Whether any mapped field differs from `current`.
    ///
    /// Null-valued properties count as absent, so a catalog that drops nulls
    /// does not cause a write on every pass.
    pub fn has_mapped_changes(&self, current: &Entity) -> bool {
        self.title != current.title
            || self.team != current.team
            || non_null(&self.properties) != non_null(&current.properties)
            || self.relations != current.relations
    }
}

fn non_null(properties: &BTreeMap<String, Value>) -> BTreeMap<&String, &Value> {
    properties.iter().filter(|(_, v)| !v.is_null()).collect()
}
