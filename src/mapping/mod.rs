//! Declarative mapping from raw records to catalog entities.
//!
//! ```text
//! MappingConfig (JSON) ──compile──► CompiledMapping ──► EntityMapper::map_batch
//!   resources[]                       one CompiledResource      raw records
//!     kind, selector.query            per resource, expressions   → entities
//!     port.entity.mappings            compiled once               + errors
//! ```

pub mod mapper;
pub mod store;

pub use mapper::{EntityMapper, MappedBatch};
pub use store::MappingStore;

use crate::error::SyncError;
use crate::expr::Expr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Mapping specification as stored in the catalog or a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingConfig {
    /// Delete owned entities that disappear from a full resync
    #[serde(default)]
    pub delete_dependent_entities: bool,
    /// Create stub entities for relation targets that do not exist yet
    #[serde(default = "default_true")]
    pub create_missing_related_entities: bool,
    /// Skip deletes when they would remove more than this fraction (0..=1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_deletion_threshold: Option<f64>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub kind: String,
    #[serde(default)]
    pub selector: SelectorConfig,
    pub port: PortConfig,
}

/// Record filter plus connector-specific options (e.g. `state`, `perPage`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

fn default_query() -> String {
    "true".to_string()
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            query: default_query(),
            options: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub entity: EntityConfig,
    /// Expression yielding an array; each element becomes one record at `.item`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_to_parse: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub mappings: EntityMappings,
}

/// Field name → expression source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMappings {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub blueprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub relations: BTreeMap<String, String>,
}

impl MappingConfig {
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::Load(format!("invalid mapping specification: {}", e)))
    }
}

/// One resource with every expression compiled.
#[derive(Debug)]
pub struct CompiledResource {
    pub kind: String,
    pub selector: Expr,
    pub options: Map<String, Value>,
    pub items_to_parse: Option<Expr>,
    pub identifier: Expr,
    pub title: Option<Expr>,
    pub blueprint: Expr,
    pub team: Option<Expr>,
    pub properties: Vec<(String, Expr)>,
    pub relations: Vec<(String, Expr)>,
}

impl CompiledResource {
    fn compile(config: &ResourceConfig) -> Result<Self, SyncError> {
        let kind = config.kind.as_str();
        if kind.trim().is_empty() {
            return Err(SyncError::Load("resource with an empty kind".to_string()));
        }
        let m = &config.port.entity.mappings;

        let field = |name: &str, source: &str| -> Result<Expr, SyncError> {
            Expr::compile(source).map_err(|e| {
                SyncError::Load(format!("kind '{}', field '{}': {}", kind, name, e))
            })
        };
        let optional = |name: &str, source: &Option<String>| -> Result<Option<Expr>, SyncError> {
            source.as_deref().map(|s| field(name, s)).transpose()
        };

        let properties = m
            .properties
            .iter()
            .map(|(name, source)| Ok((name.clone(), field(&format!("properties.{name}"), source)?)))
            .collect::<Result<Vec<_>, SyncError>>()?;
        let relations = m
            .relations
            .iter()
            .map(|(name, source)| Ok((name.clone(), field(&format!("relations.{name}"), source)?)))
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(Self {
            kind: kind.to_string(),
            selector: field("selector.query", &config.selector.query)?,
            options: config.selector.options.clone(),
            items_to_parse: optional("itemsToParse", &config.port.items_to_parse)?,
            identifier: field("identifier", &m.identifier)?,
            title: optional("title", &m.title)?,
            blueprint: field("blueprint", &m.blueprint)?,
            team: optional("team", &m.team)?,
            properties,
            relations,
        })
    }
}

/// Compiled form of a `MappingConfig`, shared across passes.
#[derive(Debug)]
pub struct CompiledMapping {
    pub delete_dependent_entities: bool,
    pub create_missing_related_entities: bool,
    pub entity_deletion_threshold: Option<f64>,
    pub resources: Vec<Arc<CompiledResource>>,
}

impl CompiledMapping {
    /// Compile every expression. Any syntax error fails the whole mapping.
    pub fn compile(config: &MappingConfig) -> Result<Self, SyncError> {
        if let Some(threshold) = config.entity_deletion_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(SyncError::Load(format!(
                    "entityDeletionThreshold must be between 0 and 1, got {}",
                    threshold
                )));
            }
        }

        let resources = config
            .resources
            .iter()
            .map(|r| CompiledResource::compile(r).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            delete_dependent_entities: config.delete_dependent_entities,
            create_missing_related_entities: config.create_missing_related_entities,
            entity_deletion_threshold: config.entity_deletion_threshold,
            resources,
        })
    }

    /// Distinct kinds in declaration order.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = Vec::new();
        for resource in &self.resources {
            if !kinds.contains(&resource.kind) {
                kinds.push(resource.kind.clone());
            }
        }
        kinds
    }

    /// All resources configured for `kind` (a kind may be listed more than once).
    pub fn resources_for(&self, kind: &str) -> Vec<Arc<CompiledResource>> {
        self.resources
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }
}
