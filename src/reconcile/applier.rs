use super::diff::compute_diff;
use super::order::WritePlan;
use crate::catalog::{BlueprintRelations, CatalogClient};
use crate::config::ReconcileConfig;
use crate::entity::{Entity, EntityRef, EntityScope};
use crate::error::SyncError;
use crate::mapping::CompiledMapping;
use crate::retry::{RetryError, RetryPolicy};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Policy flags for one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOptions {
    /// Create stubs for relation targets that do not exist
    pub create_missing_related: bool,
    /// Delete owned entities missing from the snapshot
    pub delete_dependent: bool,
    /// Skip deletes when they would remove more than this fraction of the
    /// owned entities
    pub deletion_threshold: Option<f64>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            create_missing_related: true,
            delete_dependent: false,
            deletion_threshold: None,
        }
    }
}

impl ApplyOptions {
    pub fn from_mapping(mapping: &CompiledMapping, config: &ReconcileConfig) -> Self {
        Self {
            create_missing_related: mapping.create_missing_related_entities,
            delete_dependent: mapping.delete_dependent_entities,
            deletion_threshold: mapping
                .entity_deletion_threshold
                .or(config.entity_deletion_threshold),
        }
    }
}

/// Single-entity change coming from a live event.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityDelta {
    Upsert(Entity),
    /// The entity is gone upstream
    Delete(EntityRef),
}

/// What one reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub stubs_created: usize,
    /// Deletes withheld by the deletion threshold
    pub skipped_deletes: usize,
    /// Entities (`blueprint/identifier`) whose batch failed after retries
    pub failed: Vec<String>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted + self.stubs_created
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.stubs_created += other.stubs_created;
        self.skipped_deletes += other.skipped_deletes;
        self.failed.extend(other.failed);
    }
}

/// Snapshot with relations checked against the catalog schema.
#[derive(Debug, Default)]
struct ResolvedSnapshot {
    entities: Vec<Entity>,
    /// Relation targets that are part of the snapshot, per entity
    dependencies: HashMap<EntityRef, Vec<EntityRef>>,
    /// Targets to create as stubs before anything else
    stubs: Vec<EntityRef>,
}

/// Applies snapshots and single-entity deltas to the catalog.
pub struct StateApplier {
    catalog: Arc<dyn CatalogClient>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl StateApplier {
    pub fn new(catalog: Arc<dyn CatalogClient>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            catalog,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn from_config(catalog: Arc<dyn CatalogClient>, config: &ReconcileConfig) -> Self {
        Self::new(catalog, config.batch_size, config.retry_policy())
    }

    /// Reconcile the catalog with a complete snapshot of one scope.
    ///
    /// Order: stubs, then creates and updates by relation level, then
    /// deletes. Each batch is retried on its own; a batch that still fails
    /// is recorded in the report and does not stop its siblings.
    pub async fn apply_snapshot(
        &self,
        scope: &EntityScope,
        snapshot: Vec<Entity>,
        options: &ApplyOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, SyncError> {
        let snapshot = dedupe(scope, snapshot);
        let prior = self
            .with_retry(cancel, "search entities", |_| {
                self.catalog.search_entities(scope)
            })
            .await?;
        let resolved = self
            .resolve_relations(snapshot, options.create_missing_related, cancel)
            .await?;

        let diff = compute_diff(&prior, &resolved.entities, options.delete_dependent);
        info!(
            scope = %scope,
            prior = prior.len(),
            snapshot = resolved.entities.len(),
            to_create = diff.to_create.len(),
            to_update = diff.to_update.len(),
            to_delete = diff.to_delete.len(),
            stubs = resolved.stubs.len(),
            "Computed diff"
        );

        let mut report = ApplyReport::default();
        if !resolved.stubs.is_empty() {
            self.create_stubs(&resolved.stubs, cancel, &mut report).await;
        }

        let creates: HashSet<EntityRef> = diff.to_create.iter().map(Entity::entity_ref).collect();
        let writes: Vec<Entity> = diff.writes().cloned().collect();
        let plan = WritePlan::build(writes, &resolved.dependencies);
        if !plan.placeholders.is_empty() {
            warn!(
                scope = %scope,
                count = plan.placeholders.len(),
                "Relation cycle detected, writing placeholders first"
            );
        }

        self.write_entities(scope, &plan.placeholders, Some(&creates), cancel, &mut report)
            .await;
        for level in &plan.levels {
            self.write_entities(scope, level, Some(&creates), cancel, &mut report)
                .await;
        }
        self.write_entities(scope, &plan.backfill, None, cancel, &mut report)
            .await;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        self.delete_stale(scope, prior.len(), &diff.to_delete, options, cancel, &mut report)
            .await;

        report.failed.sort();
        report.failed.dedup();
        Ok(report)
    }

    /// Apply one live-event change.
    pub async fn apply_delta(
        &self,
        scope: &EntityScope,
        delta: EntityDelta,
        options: &ApplyOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, SyncError> {
        self.apply_deltas(scope, vec![delta], options, cancel).await
    }

    /// Apply the changes one live event carries for one scope.
    ///
    /// Everything is read first: current state, relation targets and
    /// ownership. Cancellation is checked once before the first write. After
    /// that the stubs, the upsert batch and the delete batch all go out, so
    /// cancellation never leaves stubs without the entity that needed them.
    /// Entities that already match the catalog cost no writes.
    pub async fn apply_deltas(
        &self,
        scope: &EntityScope,
        deltas: Vec<EntityDelta>,
        options: &ApplyOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, SyncError> {
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for delta in deltas {
            match delta {
                EntityDelta::Upsert(entity) => upserts.push(entity),
                EntityDelta::Delete(key) => deletes.push(key),
            }
        }

        let mut changed = Vec::new();
        let mut existing = HashSet::new();
        let mut stubs = Vec::new();
        if !upserts.is_empty() {
            let resolved = self
                .resolve_relations(dedupe(scope, upserts), options.create_missing_related, cancel)
                .await?;
            for entity in resolved.entities {
                let key = entity.entity_ref();
                let current = self
                    .with_retry(cancel, "get entity", |_| self.catalog.get_entity(&key))
                    .await?;
                match current {
                    Some(current) if !entity.has_mapped_changes(&current) => {
                        debug!(entity = %key, "Entity unchanged, nothing to write");
                    }
                    Some(_) => {
                        existing.insert(key);
                        changed.push(entity);
                    }
                    None => changed.push(entity),
                }
            }
            if !changed.is_empty() {
                stubs = resolved.stubs;
            }
        }

        let mut stale = Vec::new();
        for key in deletes {
            let current = self
                .with_retry(cancel, "get entity", |_| self.catalog.get_entity(&key))
                .await?;
            let Some(current) = current else {
                debug!(entity = %key, "Entity already absent");
                continue;
            };
            if let Some(owner) = &current.datasource {
                if *owner != scope.datasource {
                    warn!(
                        entity = %key,
                        owner = %owner,
                        datasource = %scope.datasource,
                        "Not deleting entity owned by another datasource"
                    );
                    continue;
                }
            }
            if !stale.contains(&key) {
                stale.push(key);
            }
        }

        let mut report = ApplyReport::default();
        if changed.is_empty() && stale.is_empty() {
            return Ok(report);
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Past this point the writes run to completion
        let committed = CancellationToken::new();
        if !stubs.is_empty() {
            self.with_retry(&committed, "create stubs", |_| {
                self.catalog.create_stub_entities(&stubs)
            })
            .await?;
            report.stubs_created = stubs.len();
        }
        if !changed.is_empty() {
            self.with_retry(&committed, "upsert entities", |_| {
                self.catalog.upsert_entities(scope, &changed)
            })
            .await?;
            for entity in &changed {
                if existing.contains(&entity.entity_ref()) {
                    report.updated += 1;
                } else {
                    report.created += 1;
                }
                info!(entity = %entity.entity_ref(), scope = %scope, "Applied live change");
            }
        }
        if !stale.is_empty() {
            self.with_retry(&committed, "delete entities", |_| {
                self.catalog.delete_entities(scope, &stale)
            })
            .await?;
            report.deleted = stale.len();
            info!(scope = %scope, count = stale.len(), "Deleted entities gone upstream");
        }
        Ok(report)
    }

    /// Check relations against each blueprint's declared relations.
    ///
    /// Unknown relation names are dropped. Targets that are neither in the
    /// snapshot nor in the catalog become stubs, or are dropped when
    /// `create_missing` is off. Entities of blueprints the catalog does not
    /// describe keep their relations untouched.
    async fn resolve_relations(
        &self,
        mut entities: Vec<Entity>,
        create_missing: bool,
        cancel: &CancellationToken,
    ) -> Result<ResolvedSnapshot, SyncError> {
        let blueprints: BTreeSet<String> = entities.iter().map(|e| e.blueprint.clone()).collect();
        let mut schemas: HashMap<String, BlueprintRelations> = HashMap::new();
        for blueprint in blueprints {
            let relations = self
                .with_retry(cancel, "get blueprint", |_| {
                    self.catalog.blueprint_relations(&blueprint)
                })
                .await?;
            match relations {
                Some(relations) => {
                    schemas.insert(blueprint, relations);
                }
                None => debug!(blueprint = %blueprint, "Blueprint not described by catalog"),
            }
        }

        let in_snapshot: HashSet<EntityRef> = entities.iter().map(Entity::entity_ref).collect();

        let mut outside = BTreeSet::new();
        for entity in &entities {
            let Some(schema) = schemas.get(&entity.blueprint) else {
                continue;
            };
            for (name, target) in &entity.relations {
                let Some(target_blueprint) = schema.get(name) else {
                    continue;
                };
                for id in target.identifiers() {
                    let target_ref = EntityRef::new(target_blueprint.as_str(), id);
                    if !in_snapshot.contains(&target_ref) {
                        outside.insert(target_ref);
                    }
                }
            }
        }
        let existing = if outside.is_empty() {
            HashSet::new()
        } else {
            let refs: Vec<EntityRef> = outside.into_iter().collect();
            self.with_retry(cancel, "check relation targets", |_| {
                self.catalog.existing_entities(&refs)
            })
            .await?
        };

        let mut resolved = ResolvedSnapshot::default();
        let mut stubs = BTreeSet::new();
        for entity in &mut entities {
            let Some(schema) = schemas.get(&entity.blueprint) else {
                continue;
            };
            let mut dependencies = Vec::new();
            let relations = std::mem::take(&mut entity.relations);
            for (name, target) in relations {
                let Some(target_blueprint) = schema.get(&name) else {
                    warn!(
                        entity = %entity.entity_ref(),
                        relation = %name,
                        "Dropping relation not declared on blueprint"
                    );
                    continue;
                };
                let kept = target.retain(|id| {
                    let target_ref = EntityRef::new(target_blueprint.as_str(), id);
                    if in_snapshot.contains(&target_ref) {
                        dependencies.push(target_ref);
                        true
                    } else if existing.contains(&target_ref) {
                        true
                    } else if create_missing {
                        stubs.insert(target_ref);
                        true
                    } else {
                        warn!(
                            entity = %entity.identifier,
                            relation = %name,
                            target = %target_ref,
                            "Dropping relation to missing entity"
                        );
                        false
                    }
                });
                if let Some(kept) = kept {
                    entity.relations.insert(name, kept);
                }
            }
            if !dependencies.is_empty() {
                resolved.dependencies.insert(entity.entity_ref(), dependencies);
            }
        }

        resolved.entities = entities;
        resolved.stubs = stubs.into_iter().collect();
        Ok(resolved)
    }

    async fn create_stubs(
        &self,
        stubs: &[EntityRef],
        cancel: &CancellationToken,
        report: &mut ApplyReport,
    ) {
        let results = self
            .run_batches(stubs, "create stubs", cancel, |chunk| {
                self.catalog.create_stub_entities(chunk)
            })
            .await;
        for (chunk, result) in results {
            match result {
                Ok(()) => report.stubs_created += chunk.len(),
                Err(e) => {
                    error!(count = chunk.len(), error = %e, "Stub batch failed");
                    report.failed.extend(chunk.iter().map(EntityRef::to_string));
                }
            }
        }
    }

    /// Upsert `entities` in concurrent batches. With `creates` set, successful
    /// writes are counted as created or updated.
    async fn write_entities(
        &self,
        scope: &EntityScope,
        entities: &[Entity],
        creates: Option<&HashSet<EntityRef>>,
        cancel: &CancellationToken,
        report: &mut ApplyReport,
    ) {
        if entities.is_empty() {
            return;
        }
        let results = self
            .run_batches(entities, "upsert entities", cancel, |chunk| {
                self.catalog.upsert_entities(scope, chunk)
            })
            .await;

        for (chunk, result) in results {
            match result {
                Ok(()) => {
                    let Some(creates) = creates else { continue };
                    for entity in chunk {
                        if creates.contains(&entity.entity_ref()) {
                            report.created += 1;
                        } else {
                            report.updated += 1;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        scope = %scope,
                        count = chunk.len(),
                        first = %chunk[0].identifier,
                        error = %e,
                        "Entity batch failed"
                    );
                    report
                        .failed
                        .extend(chunk.iter().map(|e| e.entity_ref().to_string()));
                }
            }
        }
    }

    async fn delete_stale(
        &self,
        scope: &EntityScope,
        prior: usize,
        stale: &[EntityRef],
        options: &ApplyOptions,
        cancel: &CancellationToken,
        report: &mut ApplyReport,
    ) {
        if stale.is_empty() {
            return;
        }
        if let Some(threshold) = options.deletion_threshold {
            let ratio = stale.len() as f64 / prior.max(1) as f64;
            if ratio > threshold {
                warn!(
                    scope = %scope,
                    to_delete = stale.len(),
                    prior = prior,
                    threshold = threshold,
                    "Deletion threshold exceeded, skipping deletes"
                );
                report.skipped_deletes = stale.len();
                return;
            }
        }

        let results = self
            .run_batches(stale, "delete entities", cancel, |chunk| {
                self.catalog.delete_entities(scope, chunk)
            })
            .await;
        for (chunk, result) in results {
            match result {
                Ok(()) => report.deleted += chunk.len(),
                Err(e) => {
                    error!(scope = %scope, count = chunk.len(), error = %e, "Delete batch failed");
                    report.failed.extend(chunk.iter().map(EntityRef::to_string));
                }
            }
        }
    }

    /// Run `op` over `items` in chunks of `batch_size`, concurrently, each
    /// chunk with its own retry budget.
    async fn run_batches<'a, T, F, Fut>(
        &self,
        items: &'a [T],
        label: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Vec<(&'a [T], Result<(), RetryError<SyncError>>)>
    where
        F: Fn(&'a [T]) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let op = &op;
        let batches = items.chunks(self.batch_size).map(|chunk| async move {
            let result = self
                .retry
                .run(cancel, label, SyncError::is_transient, |_| op(chunk))
                .await;
            (chunk, result)
        });
        join_all(batches).await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        label: &str,
        op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.retry
            .run(cancel, label, SyncError::is_transient, op)
            .await
            .map_err(|e| e.into_inner().unwrap_or(SyncError::Cancelled))
    }
}

/// Keep the last entity per (blueprint, identifier), in first-seen position.
fn dedupe(scope: &EntityScope, snapshot: Vec<Entity>) -> Vec<Entity> {
    let mut position: HashMap<EntityRef, usize> = HashMap::new();
    let mut unique: Vec<Entity> = Vec::with_capacity(snapshot.len());
    for entity in snapshot {
        let key = entity.entity_ref();
        match position.get(&key) {
            Some(&i) => {
                warn!(scope = %scope, entity = %key, "Duplicate identifier in snapshot, keeping last");
                unique[i] = entity;
            }
            None => {
                position.insert(key, unique.len());
                unique.push(entity);
            }
        }
    }
    unique
}
