use super::state::{AlreadyRunning, ResyncState, RunGuard};
use super::RawDataProducer;
use crate::catalog::CatalogClient;
use crate::config::ReconcileConfig;
use crate::entity::EntityScope;
use crate::expr::EvalContext;
use crate::mapping::{CompiledMapping, EntityMapper, MappingStore};
use crate::reconcile::{ApplyOptions, StateApplier};
use crate::status::{KindSummary, ResyncStatus, StatusSink};
use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs full resync passes for one integration instance.
///
/// A pass refreshes the mapping, then processes every configured kind
/// concurrently: producer batches are mapped into a snapshot, and the
/// snapshot is reconciled once the producer is exhausted. A kind whose
/// producer fails is marked failed and not reconciled, so a partial
/// snapshot never triggers deletes.
pub struct ResyncCoordinator {
    integration: String,
    catalog: Arc<dyn CatalogClient>,
    mappings: Arc<MappingStore>,
    producer: Arc<dyn RawDataProducer>,
    applier: Arc<StateApplier>,
    mapper: EntityMapper,
    reconcile: ReconcileConfig,
    sink: Arc<dyn StatusSink>,
    state: Arc<ResyncState>,
}

impl ResyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        integration: impl Into<String>,
        datasource: impl Into<String>,
        catalog: Arc<dyn CatalogClient>,
        mappings: Arc<MappingStore>,
        producer: Arc<dyn RawDataProducer>,
        sink: Arc<dyn StatusSink>,
        reconcile: ReconcileConfig,
        ctx: EvalContext,
    ) -> Self {
        let applier = Arc::new(StateApplier::from_config(Arc::clone(&catalog), &reconcile));
        Self {
            integration: integration.into(),
            catalog,
            mappings,
            producer,
            applier,
            mapper: EntityMapper::new(datasource, ctx),
            reconcile,
            sink,
            state: ResyncState::new(),
        }
    }

    pub fn integration(&self) -> &str {
        &self.integration
    }

    pub fn datasource(&self) -> &str {
        self.mapper.datasource()
    }

    pub fn state(&self) -> &Arc<ResyncState> {
        &self.state
    }

    /// Run one pass and wait for it. Rejected while another pass runs.
    pub async fn trigger(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ResyncStatus, AlreadyRunning> {
        let guard = self.state.try_start()?;
        Ok(self.run(guard, cancel).await)
    }

    /// Start a pass in the background. The running flag is claimed before
    /// this returns, so a rejected trigger is reported to the caller.
    pub fn spawn(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<ResyncStatus>, AlreadyRunning> {
        let guard = self.state.try_start()?;
        let coordinator = Arc::clone(self);
        Ok(tokio::spawn(async move {
            coordinator.run(guard, &cancel).await
        }))
    }

    async fn run(&self, guard: RunGuard, cancel: &CancellationToken) -> ResyncStatus {
        let started = Utc::now();
        info!(integration = %self.integration, "Resync started");
        self.publish(ResyncStatus::running(started)).await;

        let status = match self.mappings.refresh(self.catalog.as_ref()).await {
            Ok(mapping) => {
                let options = ApplyOptions::from_mapping(&mapping, &self.reconcile);
                let kinds = mapping.kinds();
                let summaries = join_all(
                    kinds
                        .iter()
                        .map(|kind| self.sync_kind(&mapping, kind, &options, cancel)),
                )
                .await;
                ResyncStatus::finished(started, summaries)
            }
            Err(e) => {
                error!(integration = %self.integration, error = %e, "Resync aborted, mapping unavailable");
                ResyncStatus::aborted(started, e.to_string())
            }
        };

        self.publish(status.clone()).await;
        drop(guard);
        status
    }

    async fn sync_kind(
        &self,
        mapping: &CompiledMapping,
        kind: &str,
        options: &ApplyOptions,
        cancel: &CancellationToken,
    ) -> KindSummary {
        let mut summary = KindSummary::new(kind);
        let mut snapshot = Vec::new();

        for resource in mapping.resources_for(kind) {
            let mut batches = self.producer.batches(&resource);
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(kind = %kind, "Resync cancelled while fetching");
                        summary.fail("cancelled");
                        return summary;
                    }
                    next = batches.next() => next,
                };
                let records = match next {
                    None => break,
                    Some(Ok(records)) => records,
                    Some(Err(e)) => {
                        let e = e.into_fetch(kind);
                        error!(kind = %kind, records = summary.records, error = %e, "Fetch failed, skipping kind");
                        summary.fail(e.to_string());
                        return summary;
                    }
                };

                summary.records += records.len();
                let mapped = self.mapper.map_batch(&resource, &records);
                for err in &mapped.errors {
                    summary.record_mapping_error(err);
                }
                snapshot.extend(mapped.entities);
            }
        }

        summary.entities = snapshot.len();
        let scope = EntityScope::new(self.datasource(), kind);
        match self
            .applier
            .apply_snapshot(&scope, snapshot, options, cancel)
            .await
        {
            Ok(report) => {
                summary.created = report.created;
                summary.updated = report.updated;
                summary.deleted = report.deleted;
                summary.stubs_created = report.stubs_created;
                if !report.is_success() {
                    summary.fail(format!(
                        "{} entities failed to apply",
                        report.failed.len()
                    ));
                    summary.failed = report.failed;
                }
            }
            Err(e) => {
                error!(kind = %kind, error = %e, "Reconciliation failed");
                summary.fail(e.to_string());
            }
        }
        summary
    }

    async fn publish(&self, status: ResyncStatus) {
        self.state.set_status(status.clone());
        self.sink.report(&status).await;
    }
}
