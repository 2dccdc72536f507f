use super::*;
use crate::catalog::memory::WriteOp;
use crate::catalog::{BlueprintRelations, CatalogClient, InMemoryCatalog};
use crate::entity::{Entity, EntityRef, EntityScope, RelationTarget};
use crate::error::SyncError;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn scope() -> EntityScope {
    EntityScope::new("github/prod", "repository")
}

fn catalog() -> Arc<InMemoryCatalog> {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.register_blueprint("service", [("owner", "team"), ("dependsOn", "service")]);
    catalog.register_blueprint("team", Vec::<(String, String)>::new());
    catalog
}

fn applier(catalog: &Arc<InMemoryCatalog>, batch_size: usize) -> StateApplier {
    StateApplier::new(
        catalog.clone(),
        batch_size,
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
    )
}

fn service(id: &str, title: &str) -> Entity {
    let mut e = Entity::new(id, "service");
    e.title = Some(title.to_string());
    e
}

fn with_relation(mut entity: Entity, name: &str, target: &str) -> Entity {
    entity
        .relations
        .insert(name.to_string(), RelationTarget::One(target.to_string()));
    entity
}

fn deleting() -> ApplyOptions {
    ApplyOptions {
        delete_dependent: true,
        ..ApplyOptions::default()
    }
}

fn upsert(id: &str) -> WriteOp {
    WriteOp::Upsert(EntityRef::new("service", id))
}

#[tokio::test]
async fn test_snapshot_creates_updates_and_deletes() {
    let catalog = catalog();
    for (id, title) in [("1", "a"), ("2", "b"), ("3", "c")] {
        catalog.seed(service(id, title), Some(scope()));
    }
    let snapshot = vec![service("1", "a"), service("2", "B"), service("4", "d")];

    let report = applier(&catalog, 20)
        .apply_snapshot(&scope(), snapshot, &deleting(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.deleted, 1);
    assert!(report.is_success());
    assert!(catalog.entity("service", "3").is_none());
    assert_eq!(
        catalog.entity("service", "2").unwrap().title.as_deref(),
        Some("B")
    );
}

#[tokio::test]
async fn test_reapplying_snapshot_issues_no_writes() {
    let catalog = catalog();
    let snapshot = vec![
        with_relation(service("api", "API"), "owner", "platform"),
        with_relation(service("web", "Web"), "dependsOn", "api"),
    ];
    let applier = applier(&catalog, 20);
    let cancel = CancellationToken::new();

    let first = applier
        .apply_snapshot(&scope(), snapshot.clone(), &deleting(), &cancel)
        .await
        .unwrap();
    assert_eq!(first.created, 2);
    assert_eq!(first.stubs_created, 1);

    let writes = catalog.write_count();
    let second = applier
        .apply_snapshot(&scope(), snapshot, &deleting(), &cancel)
        .await
        .unwrap();
    assert_eq!(second.writes(), 0);
    assert_eq!(catalog.write_count(), writes);
}

#[tokio::test]
async fn test_creates_precede_deletes() {
    let catalog = catalog();
    catalog.seed(service("old", "old"), Some(scope()));

    applier(&catalog, 20)
        .apply_snapshot(
            &scope(),
            vec![service("new", "new")],
            &deleting(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        catalog.write_log(),
        vec![
            upsert("new"),
            WriteOp::Delete(EntityRef::new("service", "old")),
        ]
    );
}

#[tokio::test]
async fn test_missing_target_gets_stub_before_referencing_entity() {
    let catalog = catalog();
    let report = applier(&catalog, 20)
        .apply_snapshot(
            &scope(),
            vec![with_relation(service("api", "API"), "owner", "platform")],
            &ApplyOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.stubs_created, 1);
    assert_eq!(
        catalog.write_log(),
        vec![
            WriteOp::Stub(EntityRef::new("team", "platform")),
            upsert("api"),
        ]
    );
    // stubs are never claimed, so a later pass cannot delete them
    assert!(catalog.owner_of("team", "platform").is_none());
}

#[tokio::test]
async fn test_missing_target_dropped_without_create_missing() {
    let catalog = catalog();
    let options = ApplyOptions {
        create_missing_related: false,
        ..ApplyOptions::default()
    };
    let report = applier(&catalog, 20)
        .apply_snapshot(
            &scope(),
            vec![with_relation(service("api", "API"), "owner", "platform")],
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.stubs_created, 0);
    assert_eq!(report.created, 1);
    assert!(catalog
        .entity("service", "api")
        .unwrap()
        .relations
        .is_empty());
}

#[tokio::test]
async fn test_undeclared_relation_is_dropped() {
    let catalog = catalog();
    applier(&catalog, 20)
        .apply_snapshot(
            &scope(),
            vec![with_relation(service("api", "API"), "reviewer", "alice")],
            &ApplyOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let stored = catalog.entity("service", "api").unwrap();
    assert!(!stored.relations.contains_key("reviewer"));
}

#[tokio::test]
async fn test_relation_targets_written_first() {
    let catalog = catalog();
    let snapshot = vec![
        with_relation(service("web", "Web"), "dependsOn", "api"),
        with_relation(service("api", "API"), "dependsOn", "db"),
        service("db", "DB"),
    ];

    let report = applier(&catalog, 1)
        .apply_snapshot(&scope(), snapshot, &ApplyOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(
        catalog.write_log(),
        vec![upsert("db"), upsert("api"), upsert("web")]
    );
}

#[tokio::test]
async fn test_relation_cycle_is_back_filled() {
    let catalog = catalog();
    let snapshot = vec![
        with_relation(service("a", "A"), "dependsOn", "b"),
        with_relation(service("b", "B"), "dependsOn", "a"),
    ];

    let report = applier(&catalog, 1)
        .apply_snapshot(&scope(), snapshot, &ApplyOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.created, 2);
    assert_eq!(
        catalog.write_log(),
        vec![upsert("a"), upsert("b"), upsert("a"), upsert("b")]
    );
    for id in ["a", "b"] {
        assert!(!catalog.entity("service", id).unwrap().relations.is_empty());
    }
}

#[tokio::test]
async fn test_failed_batch_does_not_block_siblings() {
    let catalog = catalog();
    catalog.fail_upserts_containing("2", 10, true);
    let snapshot = vec![service("1", "a"), service("2", "b"), service("3", "c")];

    let report = applier(&catalog, 1)
        .apply_snapshot(&scope(), snapshot, &ApplyOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.failed, vec!["service/2".to_string()]);
    assert!(catalog.entity("service", "1").is_some());
    assert!(catalog.entity("service", "3").is_some());
}

#[tokio::test]
async fn test_transient_batch_failure_is_retried() {
    let catalog = catalog();
    catalog.fail_upserts_containing("1", 2, true);

    let report = applier(&catalog, 20)
        .apply_snapshot(
            &scope(),
            vec![service("1", "a")],
            &ApplyOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.created, 1);
}

#[tokio::test]
async fn test_terminal_batch_failure_is_not_retried() {
    let catalog = catalog();
    catalog.fail_upserts_containing("1", 1, false);

    let report = applier(&catalog, 20)
        .apply_snapshot(
            &scope(),
            vec![service("1", "a")],
            &ApplyOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.failed, vec!["service/1".to_string()]);
    assert!(catalog.entity("service", "1").is_none());
}

#[tokio::test]
async fn test_deletion_threshold_skips_mass_delete() {
    let catalog = catalog();
    for id in ["1", "2", "3", "4"] {
        catalog.seed(service(id, id), Some(scope()));
    }
    let options = ApplyOptions {
        deletion_threshold: Some(0.5),
        ..deleting()
    };

    let report = applier(&catalog, 20)
        .apply_snapshot(&scope(), vec![service("1", "1")], &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.deleted, 0);
    assert_eq!(report.skipped_deletes, 3);
    assert_eq!(catalog.len(), 4);
}

#[tokio::test]
async fn test_other_scopes_are_untouched() {
    let catalog = catalog();
    let other = EntityScope::new("github/prod", "pull-request");
    catalog.seed(service("pr-1", "pr"), Some(other.clone()));
    catalog.seed(service("manual", "manual"), None);

    let report = applier(&catalog, 20)
        .apply_snapshot(&scope(), vec![], &deleting(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.deleted, 0);
    assert_eq!(catalog.len(), 2);
}

#[tokio::test]
async fn test_duplicate_identifiers_keep_last() {
    let catalog = catalog();
    let report = applier(&catalog, 20)
        .apply_snapshot(
            &scope(),
            vec![service("1", "first"), service("1", "second")],
            &ApplyOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(
        catalog.entity("service", "1").unwrap().title.as_deref(),
        Some("second")
    );
}

#[tokio::test]
async fn test_cancelled_snapshot_writes_nothing() {
    let catalog = catalog();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = applier(&catalog, 20)
        .apply_snapshot(&scope(), vec![service("1", "a")], &deleting(), &cancel)
        .await;

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(catalog.write_count(), 0);
}

#[tokio::test]
async fn test_delta_upsert_and_unchanged() {
    let catalog = catalog();
    let applier = applier(&catalog, 20);
    let cancel = CancellationToken::new();
    let entity = service("api", "API");

    let first = applier
        .apply_delta(&scope(), EntityDelta::Upsert(entity.clone()), &ApplyOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(first.created, 1);

    let second = applier
        .apply_delta(&scope(), EntityDelta::Upsert(entity), &ApplyOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(second.writes(), 0);
    assert_eq!(catalog.write_count(), 1);

    let renamed = applier
        .apply_delta(
            &scope(),
            EntityDelta::Upsert(service("api", "Renamed")),
            &ApplyOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(renamed.updated, 1);
}

#[tokio::test]
async fn test_delta_delete() {
    let catalog = catalog();
    let applier = applier(&catalog, 20);
    let cancel = CancellationToken::new();
    applier
        .apply_delta(&scope(), EntityDelta::Upsert(service("api", "API")), &ApplyOptions::default(), &cancel)
        .await
        .unwrap();

    let report = applier
        .apply_delta(
            &scope(),
            EntityDelta::Delete(EntityRef::new("service", "api")),
            &ApplyOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(catalog.entity("service", "api").is_none());

    let again = applier
        .apply_delta(
            &scope(),
            EntityDelta::Delete(EntityRef::new("service", "api")),
            &ApplyOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(again.writes(), 0);
}

#[tokio::test]
async fn test_delta_delete_skips_foreign_entity() {
    let catalog = catalog();
    let mut foreign = service("api", "API");
    foreign.datasource = Some("gitlab/prod".to_string());
    catalog.seed(foreign, Some(EntityScope::new("gitlab/prod", "project")));

    let report = applier(&catalog, 20)
        .apply_delta(
            &scope(),
            EntityDelta::Delete(EntityRef::new("service", "api")),
            &ApplyOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.deleted, 0);
    assert!(catalog.entity("service", "api").is_some());
}

#[tokio::test]
async fn test_cancelled_delta_writes_nothing() {
    let catalog = catalog();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = applier(&catalog, 20)
        .apply_delta(
            &scope(),
            EntityDelta::Upsert(service("api", "API")),
            &ApplyOptions::default(),
            &cancel,
        )
        .await;

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(catalog.write_count(), 0);
}

/// Cancels `cancel` as soon as the stub write lands.
struct CancelAfterStubs {
    inner: Arc<InMemoryCatalog>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl CatalogClient for CancelAfterStubs {
    async fn search_entities(&self, scope: &EntityScope) -> Result<Vec<Entity>, SyncError> {
        self.inner.search_entities(scope).await
    }

    async fn get_entity(&self, entity: &EntityRef) -> Result<Option<Entity>, SyncError> {
        self.inner.get_entity(entity).await
    }

    async fn existing_entities(
        &self,
        refs: &[EntityRef],
    ) -> Result<std::collections::HashSet<EntityRef>, SyncError> {
        self.inner.existing_entities(refs).await
    }

    async fn blueprint_relations(
        &self,
        blueprint: &str,
    ) -> Result<Option<BlueprintRelations>, SyncError> {
        self.inner.blueprint_relations(blueprint).await
    }

    async fn upsert_entities(
        &self,
        scope: &EntityScope,
        entities: &[Entity],
    ) -> Result<(), SyncError> {
        self.inner.upsert_entities(scope, entities).await
    }

    async fn create_stub_entities(&self, refs: &[EntityRef]) -> Result<(), SyncError> {
        let result = self.inner.create_stub_entities(refs).await;
        self.cancel.cancel();
        result
    }

    async fn delete_entities(
        &self,
        scope: &EntityScope,
        refs: &[EntityRef],
    ) -> Result<(), SyncError> {
        self.inner.delete_entities(scope, refs).await
    }

    async fn fetch_mapping_config(
        &self,
        integration: &str,
    ) -> Result<Option<crate::mapping::MappingConfig>, SyncError> {
        self.inner.fetch_mapping_config(integration).await
    }

    async fn report_resync_state(
        &self,
        integration: &str,
        status: &crate::status::ResyncStatus,
    ) -> Result<(), SyncError> {
        self.inner.report_resync_state(integration, status).await
    }
}

#[tokio::test]
async fn test_delta_cancelled_after_stubs_still_writes_entity() {
    let catalog = catalog();
    let cancel = CancellationToken::new();
    let client = Arc::new(CancelAfterStubs {
        inner: catalog.clone(),
        cancel: cancel.clone(),
    });
    let applier = StateApplier::new(client, 20, RetryPolicy::none());

    let report = applier
        .apply_delta(
            &scope(),
            EntityDelta::Upsert(with_relation(service("api", "API"), "owner", "t1")),
            &ApplyOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(report.stubs_created, 1);
    assert_eq!(report.created, 1);
    assert_eq!(
        catalog.write_log(),
        vec![WriteOp::Stub(EntityRef::new("team", "t1")), upsert("api")]
    );
}

#[tokio::test]
async fn test_deltas_go_out_as_one_batch() {
    let catalog = catalog();
    catalog.fail_upserts_containing("b", 1, false);
    let deltas = vec![
        EntityDelta::Upsert(service("a", "A")),
        EntityDelta::Upsert(with_relation(service("b", "B"), "dependsOn", "a")),
    ];

    let result = applier(&catalog, 20)
        .apply_deltas(&scope(), deltas.clone(), &ApplyOptions::default(), &CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert_eq!(catalog.write_count(), 0);

    let report = applier(&catalog, 20)
        .apply_deltas(&scope(), deltas, &ApplyOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(catalog.write_log(), vec![upsert("a"), upsert("b")]);
}
