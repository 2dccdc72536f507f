use super::{BlueprintRelations, CatalogClient};
use crate::entity::{Entity, EntityRef, EntityScope};
use crate::error::SyncError;
use crate::mapping::MappingConfig;
use crate::status::ResyncStatus;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// One write as seen by the catalog, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Upsert(EntityRef),
    Stub(EntityRef),
    Delete(EntityRef),
}

#[derive(Debug, Clone)]
struct StoredEntity {
    entity: Entity,
    owner: Option<EntityScope>,
}

/// Injected failure for upserts that touch a given identifier.
#[derive(Debug, Clone)]
struct UpsertFailure {
    identifier: String,
    remaining: u32,
    transient: bool,
}

/// Catalog kept in memory. Used for dry runs and tests.
///
/// Upserts are rejected when a relation points to an entity that does not
/// exist, like a real catalog would, so write ordering is observable.
pub struct InMemoryCatalog {
    entities: DashMap<EntityRef, StoredEntity>,
    blueprints: DashMap<String, BlueprintRelations>,
    mappings: DashMap<String, MappingConfig>,
    resync_states: DashMap<String, ResyncStatus>,
    writes: AtomicU64,
    log: Mutex<Vec<WriteOp>>,
    upsert_failures: Mutex<Vec<UpsertFailure>>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            blueprints: DashMap::new(),
            mappings: DashMap::new(),
            resync_states: DashMap::new(),
            writes: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            upsert_failures: Mutex::new(Vec::new()),
        }
    }

    /// Declare a blueprint and its relations (name → target blueprint).
    pub fn register_blueprint<I, K, V>(&self, blueprint: &str, relations: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.blueprints.insert(
            blueprint.to_string(),
            relations
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
    }

    pub fn set_mapping_config(&self, integration: &str, config: MappingConfig) {
        self.mappings.insert(integration.to_string(), config);
    }

    /// Seed an entity without counting it as a write.
    pub fn seed(&self, entity: Entity, owner: Option<EntityScope>) {
        self.entities
            .insert(entity.entity_ref(), StoredEntity { entity, owner });
    }

    /// Make the next `times` upserts containing `identifier` fail.
    pub fn fail_upserts_containing(&self, identifier: &str, times: u32, transient: bool) {
        self.upsert_failures.lock().unwrap().push(UpsertFailure {
            identifier: identifier.to_string(),
            remaining: times,
            transient,
        });
    }

    pub fn entity(&self, blueprint: &str, identifier: &str) -> Option<Entity> {
        self.entities
            .get(&EntityRef::new(blueprint, identifier))
            .map(|s| s.entity.clone())
    }

    pub fn owner_of(&self, blueprint: &str, identifier: &str) -> Option<EntityScope> {
        self.entities
            .get(&EntityRef::new(blueprint, identifier))
            .and_then(|s| s.owner.clone())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities written (upserted, stubbed or deleted) so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn write_log(&self) -> Vec<WriteOp> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_write_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn resync_state(&self, integration: &str) -> Option<ResyncStatus> {
        self.resync_states.get(integration).map(|s| s.clone())
    }

    fn record(&self, op: WriteOp) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(op);
    }

    fn take_injected_failure(&self, entities: &[Entity]) -> Option<SyncError> {
        let mut failures = self.upsert_failures.lock().unwrap();
        let failure = failures.iter_mut().find(|f| {
            f.remaining > 0 && entities.iter().any(|e| e.identifier == f.identifier)
        })?;
        failure.remaining -= 1;
        Some(SyncError::Apply {
            message: format!("injected failure for '{}'", failure.identifier),
            transient: failure.transient,
        })
    }

    /// Relation targets must exist already or be part of the same batch.
    fn check_relations(&self, entity: &Entity, batch: &[Entity]) -> Result<(), SyncError> {
        let Some(relations) = self.blueprints.get(&entity.blueprint) else {
            return Ok(());
        };
        for (name, target) in &entity.relations {
            let Some(target_blueprint) = relations.get(name) else {
                return Err(SyncError::Apply {
                    message: format!(
                        "blueprint '{}' has no relation '{}'",
                        entity.blueprint, name
                    ),
                    transient: false,
                });
            };
            for id in target.identifiers() {
                let target_ref = EntityRef::new(target_blueprint.clone(), id);
                let in_batch = batch.iter().any(|e| e.entity_ref() == target_ref);
                if !in_batch && !self.entities.contains_key(&target_ref) {
                    return Err(SyncError::Apply {
                        message: format!(
                            "entity '{}' relates to missing '{}/{}'",
                            entity.identifier, target_blueprint, id
                        ),
                        transient: false,
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn search_entities(&self, scope: &EntityScope) -> Result<Vec<Entity>, SyncError> {
        let mut found: Vec<Entity> = self
            .entities
            .iter()
            .filter(|s| s.owner.as_ref() == Some(scope))
            .map(|s| s.entity.clone())
            .collect();
        found.sort_by(|a, b| a.entity_ref().cmp(&b.entity_ref()));
        Ok(found)
    }

    async fn get_entity(&self, entity: &EntityRef) -> Result<Option<Entity>, SyncError> {
        Ok(self.entities.get(entity).map(|s| s.entity.clone()))
    }

    async fn existing_entities(
        &self,
        refs: &[EntityRef],
    ) -> Result<HashSet<EntityRef>, SyncError> {
        Ok(refs
            .iter()
            .filter(|r| self.entities.contains_key(*r))
            .cloned()
            .collect())
    }

    async fn blueprint_relations(
        &self,
        blueprint: &str,
    ) -> Result<Option<BlueprintRelations>, SyncError> {
        Ok(self.blueprints.get(blueprint).map(|r| r.clone()))
    }

    async fn upsert_entities(
        &self,
        scope: &EntityScope,
        entities: &[Entity],
    ) -> Result<(), SyncError> {
        if let Some(err) = self.take_injected_failure(entities) {
            return Err(err);
        }
        // Validate the whole batch before writing any of it
        for entity in entities {
            self.check_relations(entity, entities)?;
        }

        for entity in entities {
            debug!(entity = %entity.entity_ref(), scope = %scope, "Upsert");
            self.entities.insert(
                entity.entity_ref(),
                StoredEntity {
                    entity: Entity {
                        datasource: Some(scope.datasource.clone()),
                        ..entity.clone()
                    },
                    owner: Some(scope.clone()),
                },
            );
            self.record(WriteOp::Upsert(entity.entity_ref()));
        }
        Ok(())
    }

    async fn create_stub_entities(&self, refs: &[EntityRef]) -> Result<(), SyncError> {
        for entity_ref in refs {
            if self.entities.contains_key(entity_ref) {
                continue;
            }
            self.entities.insert(
                entity_ref.clone(),
                StoredEntity {
                    entity: Entity::stub(entity_ref),
                    owner: None,
                },
            );
            self.record(WriteOp::Stub(entity_ref.clone()));
        }
        Ok(())
    }

    async fn delete_entities(
        &self,
        scope: &EntityScope,
        refs: &[EntityRef],
    ) -> Result<(), SyncError> {
        for entity_ref in refs {
            let removed = self
                .entities
                .remove_if(entity_ref, |_, stored| stored.owner.as_ref() == Some(scope));
            if removed.is_some() {
                self.record(WriteOp::Delete(entity_ref.clone()));
            }
        }
        Ok(())
    }

    async fn fetch_mapping_config(
        &self,
        integration: &str,
    ) -> Result<Option<MappingConfig>, SyncError> {
        Ok(self.mappings.get(integration).map(|m| m.clone()))
    }

    async fn report_resync_state(
        &self,
        integration: &str,
        status: &ResyncStatus,
    ) -> Result<(), SyncError> {
        self.resync_states
            .insert(integration.to_string(), status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::RelationTarget;

    fn scope() -> EntityScope {
        EntityScope::new("github/prod", "repository")
    }

    fn service(id: &str, owner: Option<&str>) -> Entity {
        let mut entity = Entity::new(id, "service");
        if let Some(owner) = owner {
            entity
                .relations
                .insert("owner".to_string(), RelationTarget::One(owner.to_string()));
        }
        entity
    }

    #[tokio::test]
    async fn test_upsert_and_search_by_scope() {
        let catalog = InMemoryCatalog::new();
        catalog
            .upsert_entities(&scope(), &[service("a", None), service("b", None)])
            .await
            .unwrap();
        catalog
            .upsert_entities(&EntityScope::new("other", "repository"), &[service("c", None)])
            .await
            .unwrap();

        let found = catalog.search_entities(&scope()).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(catalog.write_count(), 3);
    }

    #[tokio::test]
    async fn test_relation_to_missing_target_rejected() {
        let catalog = InMemoryCatalog::new();
        catalog.register_blueprint("service", [("owner", "team")]);

        let err = catalog
            .upsert_entities(&scope(), &[service("a", Some("platform"))])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(catalog.write_count(), 0);

        catalog
            .create_stub_entities(&[EntityRef::new("team", "platform")])
            .await
            .unwrap();
        catalog
            .upsert_entities(&scope(), &[service("a", Some("platform"))])
            .await
            .unwrap();
        assert_eq!(
            catalog.write_log(),
            vec![
                WriteOp::Stub(EntityRef::new("team", "platform")),
                WriteOp::Upsert(EntityRef::new("service", "a")),
            ]
        );
    }

    #[tokio::test]
    async fn test_stubs_do_not_overwrite_and_are_unowned() {
        let catalog = InMemoryCatalog::new();
        let mut existing = Entity::new("platform", "team");
        existing.title = Some("Platform".to_string());
        catalog.seed(existing, None);

        catalog
            .create_stub_entities(&[EntityRef::new("team", "platform"), EntityRef::new("team", "data")])
            .await
            .unwrap();

        assert_eq!(
            catalog.entity("team", "platform").unwrap().title.as_deref(),
            Some("Platform")
        );
        assert!(catalog.entity("team", "data").is_some());
        assert!(catalog.owner_of("team", "data").is_none());
        assert_eq!(catalog.write_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_only_removes_owned_entities() {
        let catalog = InMemoryCatalog::new();
        catalog.seed(service("foreign", None), Some(EntityScope::new("other", "repository")));
        catalog.seed(service("mine", None), Some(scope()));

        catalog
            .delete_entities(
                &scope(),
                &[
                    EntityRef::new("service", "foreign"),
                    EntityRef::new("service", "mine"),
                ],
            )
            .await
            .unwrap();

        assert!(catalog.entity("service", "foreign").is_some());
        assert!(catalog.entity("service", "mine").is_none());
        assert_eq!(catalog.write_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let catalog = InMemoryCatalog::new();
        catalog.fail_upserts_containing("a", 1, true);

        let err = catalog
            .upsert_entities(&scope(), &[service("a", None)])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(catalog
            .upsert_entities(&scope(), &[service("a", None)])
            .await
            .is_ok());
    }
}
