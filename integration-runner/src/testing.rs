//! Fixtures shared by the runner's unit tests.

use catalog_sync::catalog::{CatalogClient, InMemoryCatalog};
use catalog_sync::config::ReconcileConfig;
use catalog_sync::error::SyncError;
use catalog_sync::expr::EvalContext;
use catalog_sync::mapping::{CompiledResource, MappingConfig, MappingStore};
use catalog_sync::resync::{RawDataProducer, ResyncCoordinator};
use catalog_sync::status::LogStatusSink;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub fn repository_mapping() -> MappingConfig {
    serde_json::from_value(json!({
        "deleteDependentEntities": true,
        "resources": [{
            "kind": "repository",
            "port": {"entity": {"mappings": {
                "identifier": ".name",
                "title": ".name",
                "blueprint": "\"service\""
            }}}
        }]
    }))
    .unwrap()
}

pub fn coordinator(
    catalog: &Arc<InMemoryCatalog>,
    producer: impl RawDataProducer + 'static,
) -> Arc<ResyncCoordinator> {
    let catalog_client: Arc<dyn CatalogClient> = catalog.clone();
    Arc::new(ResyncCoordinator::new(
        "gh",
        "github/test",
        catalog_client,
        Arc::new(MappingStore::new("gh", Some(repository_mapping()))),
        Arc::new(producer),
        Arc::new(LogStatusSink),
        ReconcileConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..ReconcileConfig::default()
        },
        EvalContext::default(),
    ))
}

/// Serves one batch once a permit is released.
pub struct GatedProducer {
    records: Vec<Value>,
    pub release: Arc<Semaphore>,
}

impl GatedProducer {
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records,
            release: Arc::new(Semaphore::new(0)),
        }
    }
}

impl RawDataProducer for GatedProducer {
    fn batches<'a>(
        &'a self,
        _resource: &'a CompiledResource,
    ) -> BoxStream<'a, Result<Vec<Value>, SyncError>> {
        let release = Arc::clone(&self.release);
        futures::stream::once(async move {
            let _permit = release.acquire().await;
            Ok(self.records.clone())
        })
        .boxed()
    }
}
