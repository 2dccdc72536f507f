//! Catalog collaborator: the system the engine keeps consistent.

pub mod http;
pub mod memory;

pub use http::HttpCatalogClient;
pub use memory::InMemoryCatalog;

use crate::entity::{Entity, EntityRef, EntityScope};
use crate::error::SyncError;
use crate::mapping::MappingConfig;
use crate::status::ResyncStatus;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};

/// Relation name → target blueprint.
pub type BlueprintRelations = BTreeMap<String, String>;

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Entities currently owned by `scope` (prior state for diffing).
    async fn search_entities(&self, scope: &EntityScope) -> Result<Vec<Entity>, SyncError>;

    async fn get_entity(&self, entity: &EntityRef) -> Result<Option<Entity>, SyncError>;

    /// Subset of `refs` that exist, regardless of owner.
    async fn existing_entities(
        &self,
        refs: &[EntityRef],
    ) -> Result<HashSet<EntityRef>, SyncError>;

    /// Relations declared by `blueprint`, or `None` if the blueprint is unknown.
    async fn blueprint_relations(
        &self,
        blueprint: &str,
    ) -> Result<Option<BlueprintRelations>, SyncError>;

    /// Create or replace entities, claiming them for `scope`.
    async fn upsert_entities(
        &self,
        scope: &EntityScope,
        entities: &[Entity],
    ) -> Result<(), SyncError>;

    /// Create empty, unowned entities. Existing entities are left untouched.
    async fn create_stub_entities(&self, refs: &[EntityRef]) -> Result<(), SyncError>;

    /// Delete entities owned by `scope`.
    async fn delete_entities(
        &self,
        scope: &EntityScope,
        refs: &[EntityRef],
    ) -> Result<(), SyncError>;

    /// Mapping specification stored for an integration instance.
    async fn fetch_mapping_config(
        &self,
        integration: &str,
    ) -> Result<Option<MappingConfig>, SyncError>;

    async fn report_resync_state(
        &self,
        integration: &str,
        status: &ResyncStatus,
    ) -> Result<(), SyncError>;
}
