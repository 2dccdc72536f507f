// End-to-end flows against the in-memory catalog: mapping, diffing,
// live event discard and retry exhaustion.

use async_trait::async_trait;
use catalog_sync::catalog::{CatalogClient, InMemoryCatalog};
use catalog_sync::config::ReconcileConfig;
use catalog_sync::entity::{Entity, EntityRef, EntityScope};
use catalog_sync::error::SyncError;
use catalog_sync::event::{EventState, LiveEvent};
use catalog_sync::expr::EvalContext;
use catalog_sync::http::RequestError;
use catalog_sync::mapping::{CompiledMapping, EntityMapper, MappingConfig, MappingStore};
use catalog_sync::reconcile::compute_diff;
use catalog_sync::resync::{ResyncCoordinator, StaticProducer};
use catalog_sync::retry::RetryPolicy;
use catalog_sync::status::{LogStatusSink, ResyncPhase};
use catalog_sync::webhook::{
    ErrorHook, EventDispatcher, ProcessError, ProcessorRegistry, RawUpdate, WebhookProcessor,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DATASOURCE: &str = "tracker/prod";

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn mapping(selector: &str, delete_dependent: bool) -> MappingConfig {
    serde_json::from_value(json!({
        "deleteDependentEntities": delete_dependent,
        "resources": [{
            "kind": "item",
            "selector": {"query": selector},
            "port": {"entity": {"mappings": {
                "identifier": ".id | tostring",
                "title": ".name",
                "blueprint": "\"item\""
            }}}
        }]
    }))
    .unwrap()
}

fn records() -> Vec<Value> {
    vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})]
}

fn map_all(config: &MappingConfig) -> Vec<Entity> {
    let mapping = CompiledMapping::compile(config).unwrap();
    let mapper = EntityMapper::new(DATASOURCE, EvalContext::default());
    let resource = &mapping.resources_for("item")[0];
    let batch = mapper.map_batch(resource, &records());
    assert!(batch.errors.is_empty());
    batch.entities
}

fn item(id: &str, title: &str) -> Entity {
    Entity {
        title: Some(title.to_string()),
        datasource: Some(DATASOURCE.to_string()),
        ..Entity::new(id, "item")
    }
}

fn coordinator(catalog: &Arc<InMemoryCatalog>, config: MappingConfig) -> ResyncCoordinator {
    let client: Arc<dyn CatalogClient> = catalog.clone();
    ResyncCoordinator::new(
        "tracker",
        DATASOURCE,
        client,
        Arc::new(MappingStore::new("tracker", Some(config))),
        Arc::new(StaticProducer::new().with_batch("item", records())),
        Arc::new(LogStatusSink),
        ReconcileConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..ReconcileConfig::default()
        },
        EvalContext::default(),
    )
}

// ── Mapping ──────────────────────────────────────────────────────────────────

#[test]
fn test_every_record_maps_to_an_entity() {
    let entities = map_all(&mapping("true", false));

    let produced: Vec<(&str, Option<&str>)> = entities
        .iter()
        .map(|e| (e.identifier.as_str(), e.title.as_deref()))
        .collect();
    assert_eq!(produced, vec![("1", Some("a")), ("2", Some("b"))]);
}

#[test]
fn test_selector_filters_records() {
    let entities = map_all(&mapping(r#".name == "a""#, false));

    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].identifier, "1");
    assert_eq!(entities[0].title.as_deref(), Some("a"));
}

// ── Diff ────────────────────────────────────────────────────────────────────

#[test]
fn test_diff_against_prior_set() {
    let prior = vec![item("1", "old"), item("2", "old"), item("3", "c")];
    let snapshot = vec![item("1", "a"), item("2", "b")];

    let diff = compute_diff(&prior, &snapshot, true);

    assert!(diff.to_create.is_empty());
    let updated: Vec<&str> = diff.to_update.iter().map(|e| e.identifier.as_str()).collect();
    assert_eq!(updated, vec!["1", "2"]);
    assert_eq!(diff.to_delete, vec![EntityRef::new("item", "3")]);
}

#[tokio::test]
async fn test_full_resync_deletes_stale_entity() {
    let catalog = Arc::new(InMemoryCatalog::new());
    let scope = EntityScope::new(DATASOURCE, "item");
    for entity in [item("1", "old"), item("2", "old"), item("3", "c")] {
        catalog.seed(entity, Some(scope.clone()));
    }

    let status = coordinator(&catalog, mapping("true", true))
        .trigger(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(status.phase, ResyncPhase::Completed);
    let summary = status.kind("item").unwrap();
    assert_eq!((summary.created, summary.updated, summary.deleted), (0, 2, 1));
    assert_eq!(catalog.entity("item", "1").unwrap().title.as_deref(), Some("a"));
    assert!(catalog.entity("item", "3").is_none());
}

#[tokio::test]
async fn test_stale_entity_kept_without_delete_dependent() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.seed(item("3", "c"), Some(EntityScope::new(DATASOURCE, "item")));

    coordinator(&catalog, mapping("true", false))
        .trigger(&CancellationToken::new())
        .await
        .unwrap();

    assert!(catalog.entity("item", "3").is_some());
    assert!(catalog.entity("item", "1").is_some());
}

// ── Live events ───────────────────────────────────────────────────────────────

/// Processor whose authoritative fetch always answers 500.
struct FailingProcessor {
    calls: AtomicU32,
}

#[async_trait]
impl WebhookProcessor for FailingProcessor {
    fn name(&self) -> &str {
        "items"
    }

    fn should_process(&self, event: &LiveEvent) -> bool {
        event.header("x-event") == Some("item")
    }

    fn matching_kinds(&self, _event: &LiveEvent) -> Vec<String> {
        vec!["item".to_string()]
    }

    async fn authenticate(&self, _event: &LiveEvent) -> Result<(), SyncError> {
        Ok(())
    }

    async fn validate(&self, _event: &LiveEvent) -> Result<(), SyncError> {
        Ok(())
    }

    async fn fetch(&self, _event: &LiveEvent, _kind: &str) -> Result<RawUpdate, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::Upstream(RequestError::Status {
            status: 500,
            body: "internal error".to_string(),
        }))
    }
}

#[derive(Default)]
struct CountingHook {
    calls: AtomicU32,
}

#[async_trait]
impl ErrorHook for CountingHook {
    async fn on_error(&self, _event: &LiveEvent, _processor: &str, _error: &ProcessError) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct LiveFixture {
    catalog: Arc<InMemoryCatalog>,
    processor: Arc<FailingProcessor>,
    hook: Arc<CountingHook>,
    dispatcher: EventDispatcher,
}

fn live_fixture() -> LiveFixture {
    let catalog = Arc::new(InMemoryCatalog::new());
    let processor = Arc::new(FailingProcessor {
        calls: AtomicU32::new(0),
    });
    let hook = Arc::new(CountingHook::default());

    let mut registry = ProcessorRegistry::new();
    registry.register("tracker", processor.clone());
    let dispatcher = EventDispatcher::new(
        Arc::new(registry),
        catalog.clone(),
        Arc::new(MappingStore::new("tracker", Some(mapping("true", false)))),
        EntityMapper::new(DATASOURCE, EvalContext::default()),
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
    )
    .with_error_hook(hook.clone());

    LiveFixture {
        catalog,
        processor,
        hook,
        dispatcher,
    }
}

fn live_event(event_header: &str) -> LiveEvent {
    LiveEvent::from_request(
        "tracker",
        [("X-Event", event_header)],
        br#"{"id": 1, "name": "a"}"#.to_vec(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_unmatched_event_is_discarded() {
    let fx = live_fixture();

    let outcomes = fx
        .dispatcher
        .dispatch(&live_event("comment"), &CancellationToken::new())
        .await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, EventState::Discarded);
    assert_eq!(fx.processor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.hook.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.catalog.write_count(), 0);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let fx = live_fixture();

    let outcomes = fx
        .dispatcher
        .dispatch(&live_event("item"), &CancellationToken::new())
        .await;

    assert_eq!(outcomes[0].state, EventState::Failed);
    assert_eq!(fx.processor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(fx.hook.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.catalog.write_count(), 0);
    assert!(fx.catalog.is_empty());
}
