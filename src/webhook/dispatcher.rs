use super::hook::{ErrorHook, LoggingErrorHook};
use super::processor::{ProcessError, RawUpdate, WebhookProcessor};
use super::registry::ProcessorRegistry;
use crate::catalog::CatalogClient;
use crate::entity::EntityScope;
use crate::error::SyncError;
use crate::event::{EventState, LiveEvent};
use crate::mapping::{CompiledMapping, CompiledResource, EntityMapper, MappingStore};
use crate::reconcile::{ApplyOptions, ApplyReport, EntityDelta, StateApplier};
use crate::retry::{RetryError, RetryPolicy};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final state of one event for one processor.
#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub event_id: Uuid,
    pub route: String,
    /// `None` when no processor matched
    pub processor: Option<String>,
    pub state: EventState,
    /// Pipeline attempts made (authentication and validation are not retried)
    pub attempts: u32,
    pub report: ApplyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventOutcome {
    fn new(event: &LiveEvent, processor: Option<&str>, state: EventState) -> Self {
        Self {
            event_id: event.id,
            route: event.route.clone(),
            processor: processor.map(str::to_string),
            state,
            attempts: 0,
            report: ApplyReport::default(),
            error: None,
        }
    }
}

/// Routes live events to processors and runs the per-event pipeline:
/// authenticate → validate → fetch → map → apply.
///
/// Fetch, map and apply are retried together on transient failures. Terminal
/// failures go to the error hook exactly once. Every matching kind is fetched
/// and mapped before the first write, so a failed fetch writes nothing.
pub struct EventDispatcher {
    registry: Arc<ProcessorRegistry>,
    catalog: Arc<dyn CatalogClient>,
    mappings: Arc<MappingStore>,
    mapper: EntityMapper,
    applier: StateApplier,
    retry: RetryPolicy,
    hook: Arc<dyn ErrorHook>,
    outcomes: broadcast::Sender<EventOutcome>,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        catalog: Arc<dyn CatalogClient>,
        mappings: Arc<MappingStore>,
        mapper: EntityMapper,
        retry: RetryPolicy,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(256);
        // The pipeline retry covers apply; the applier itself makes one attempt
        let applier = StateApplier::new(Arc::clone(&catalog), 1, RetryPolicy::none());
        Self {
            registry,
            catalog,
            mappings,
            mapper,
            applier,
            retry,
            hook: Arc::new(LoggingErrorHook),
            outcomes,
        }
    }

    pub fn with_error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Outcomes of every processed event, in completion order.
    pub fn subscribe(&self) -> broadcast::Receiver<EventOutcome> {
        self.outcomes.subscribe()
    }

    /// Run `event` through every matching processor concurrently.
    pub async fn dispatch(&self, event: &LiveEvent, cancel: &CancellationToken) -> Vec<EventOutcome> {
        let processors = self.registry.matching(event);
        if processors.is_empty() {
            info!(
                event_id = %event.id,
                route = %event.route,
                "No processor matched, discarding event"
            );
            let outcome = EventOutcome::new(event, None, EventState::Discarded);
            self.publish(&outcome);
            return vec![outcome];
        }

        join_all(
            processors
                .iter()
                .map(|processor| self.process(event, processor.as_ref(), cancel)),
        )
        .await
    }

    async fn process(
        &self,
        event: &LiveEvent,
        processor: &dyn WebhookProcessor,
        cancel: &CancellationToken,
    ) -> EventOutcome {
        let name = processor.name();
        let mut attempts = 0;

        let result = match self.check(event, processor).await {
            Err(e) => Err(RetryError::Terminal(e)),
            Ok(()) => {
                self.retry
                    .run(cancel, name, ProcessError::is_transient, |attempt| {
                        attempts = attempt + 1;
                        self.run_pipeline(event, processor, cancel)
                    })
                    .await
            }
        };

        let mut outcome = EventOutcome::new(event, Some(name), EventState::Completed);
        outcome.attempts = attempts;
        match result {
            Ok(report) => {
                info!(
                    event_id = %event.id,
                    processor = %name,
                    created = report.created,
                    updated = report.updated,
                    deleted = report.deleted,
                    "Live event completed"
                );
                outcome.report = report;
            }
            Err(RetryError::Cancelled) => {
                warn!(event_id = %event.id, processor = %name, "Live event cancelled");
                outcome.state = EventState::Failed;
                outcome.error = Some(SyncError::Cancelled.to_string());
            }
            Err(RetryError::Terminal(e)) | Err(RetryError::Exhausted { last: e, .. }) => {
                outcome.state = EventState::Failed;
                outcome.error = Some(e.to_string());
                if e.is_cancelled() {
                    warn!(event_id = %event.id, processor = %name, "Live event cancelled");
                } else {
                    self.hook.on_error(event, name, &e).await;
                }
            }
        }

        self.publish(&outcome);
        outcome
    }

    /// Authentication and payload validation. Never retried.
    async fn check(
        &self,
        event: &LiveEvent,
        processor: &dyn WebhookProcessor,
    ) -> Result<(), ProcessError> {
        self.trace(event, processor, EventState::Authenticating);
        processor
            .authenticate(event)
            .await
            .map_err(|e| ProcessError::new(EventState::Authenticating, terminal(e, SyncError::Auth)))?;

        self.trace(event, processor, EventState::Validating);
        processor
            .validate(event)
            .await
            .map_err(|e| ProcessError::new(EventState::Validating, terminal(e, SyncError::Validation)))
    }

    async fn run_pipeline(
        &self,
        event: &LiveEvent,
        processor: &dyn WebhookProcessor,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, ProcessError> {
        let mapping = self
            .mapping()
            .await
            .map_err(|e| ProcessError::new(EventState::Mapping, e))?;
        let options = ApplyOptions {
            create_missing_related: mapping.create_missing_related_entities,
            ..ApplyOptions::default()
        };

        // Every kind is fetched and mapped before anything is written
        let mut pending = Vec::new();
        for kind in processor.matching_kinds(event) {
            let resources = mapping.resources_for(&kind);
            if resources.is_empty() {
                debug!(event_id = %event.id, kind = %kind, "Kind not in mapping, skipping");
                continue;
            }

            self.trace(event, processor, EventState::Fetching);
            let update = processor
                .fetch(event, &kind)
                .await
                .map_err(|e| ProcessError::new(EventState::Fetching, e.into_fetch(&kind)))?;

            self.trace(event, processor, EventState::Mapping);
            let deltas = self
                .map_update(&resources, &update)
                .map_err(|e| ProcessError::new(EventState::Mapping, e))?;
            if !deltas.is_empty() {
                let scope = EntityScope::new(self.mapper.datasource(), kind.as_str());
                pending.push((scope, deltas));
            }
        }

        if cancel.is_cancelled() {
            return Err(ProcessError::new(EventState::Applying, SyncError::Cancelled));
        }
        self.trace(event, processor, EventState::Applying);
        // Once applying starts every kind is written
        let committed = CancellationToken::new();
        let mut total = ApplyReport::default();
        for (scope, deltas) in pending {
            let report = self
                .applier
                .apply_deltas(&scope, deltas, &options, &committed)
                .await
                .map_err(|e| ProcessError::new(EventState::Applying, e))?;
            total.merge(report);
        }
        Ok(total)
    }

    fn map_update(
        &self,
        resources: &[Arc<CompiledResource>],
        update: &RawUpdate,
    ) -> Result<Vec<EntityDelta>, SyncError> {
        let mut deltas = Vec::new();
        for resource in resources {
            for record in &update.updated {
                for entity in self.mapper.map_record(resource, record)? {
                    deltas.push(EntityDelta::Upsert(entity));
                }
            }
            for record in &update.deleted {
                for entity in self.mapper.map_record(resource, record)? {
                    deltas.push(EntityDelta::Delete(entity.entity_ref()));
                }
            }
        }
        Ok(deltas)
    }

    async fn mapping(&self) -> Result<Arc<CompiledMapping>, SyncError> {
        match self.mappings.current() {
            Some(mapping) => Ok(mapping),
            None => self.mappings.refresh(self.catalog.as_ref()).await,
        }
    }

    fn trace(&self, event: &LiveEvent, processor: &dyn WebhookProcessor, state: EventState) {
        debug!(
            event_id = %event.id,
            processor = %processor.name(),
            state = %state,
            "Event state"
        );
    }

    fn publish(&self, outcome: &EventOutcome) {
        // no subscribers is fine
        let _ = self.outcomes.send(outcome.clone());
    }
}

/// Authentication and validation failures are terminal whatever the
/// processor returned; keep their message under the right variant.
fn terminal(error: SyncError, wrap: fn(String) -> SyncError) -> SyncError {
    match error {
        SyncError::Auth(_) | SyncError::Validation(_) => error,
        other => wrap(other.to_string()),
    }
}
