use catalog_sync::mapping::MappingConfig;
use catalog_sync::resync::RawDataProducer;
use catalog_sync::webhook::WebhookProcessor;
use std::sync::Arc;

/// Third-party system the runner keeps the catalog in sync with.
///
/// An integration supplies the two connector-specific pieces the engine
/// cannot know about: how to pull raw records for a kind (full resync) and
/// how to turn a webhook delivery into authoritative records (live events).
/// Everything else (mapping, diffing, writes, retries) is handled by the
/// engine.
///
/// # Example
/// ```no_run
/// use catalog_sync::resync::{RawDataProducer, StaticProducer};
/// use catalog_sync::webhook::WebhookProcessor;
/// use integration_runner::Integration;
/// use std::sync::Arc;
///
/// struct Fixture;
///
/// impl Integration for Fixture {
///     fn name(&self) -> &str {
///         "fixture"
///     }
///
///     fn producer(&self) -> Arc<dyn RawDataProducer> {
///         Arc::new(StaticProducer::new())
///     }
///
///     fn processors(&self) -> Vec<Arc<dyn WebhookProcessor>> {
///         vec![]
///     }
/// }
/// ```
pub trait Integration: Send + Sync {
    /// Integration type, also used as the webhook route
    /// (`/integration/webhook/{name}`).
    fn name(&self) -> &str;

    /// Raw data source for full resyncs.
    fn producer(&self) -> Arc<dyn RawDataProducer>;

    /// Webhook processors, all registered under [`Integration::name`].
    fn processors(&self) -> Vec<Arc<dyn WebhookProcessor>>;

    /// Mapping used when neither the catalog nor a mapping file provides one.
    fn default_mapping(&self) -> Option<MappingConfig> {
        None
    }
}
