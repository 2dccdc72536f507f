use crate::catalog::CatalogClient;
use crate::error::SyncError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

const MAX_REPORTED_FAILURES: usize = 20;

/// Resync state machine: IDLE → RUNNING → {COMPLETED, FAILED} → IDLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncPhase {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindStatus {
    Completed,
    Failed,
}

/// Outcome of one kind within a resync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindSummary {
    pub kind: String,
    pub status: KindStatus,
    /// Raw records received from the producer
    pub records: usize,
    /// Candidate entities after mapping
    pub entities: usize,
    pub mapping_errors: usize,
    /// First few mapping failures, with kind and record context
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping_failures: Vec<String>,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub stubs_created: usize,
    /// Entities whose batch failed after retries
    pub failed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KindSummary {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status: KindStatus::Completed,
            records: 0,
            entities: 0,
            mapping_errors: 0,
            mapping_failures: Vec::new(),
            created: 0,
            updated: 0,
            deleted: 0,
            stubs_created: 0,
            failed: Vec::new(),
            error: None,
        }
    }

    pub fn failed(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: KindStatus::Failed,
            error: Some(error.into()),
            ..Self::new(kind)
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = KindStatus::Failed;
        self.error = Some(error.into());
    }

    /// Count a skipped record, keeping its message while under the cap.
    pub fn record_mapping_error(&mut self, error: &SyncError) {
        self.mapping_errors += 1;
        if self.mapping_failures.len() < MAX_REPORTED_FAILURES {
            self.mapping_failures.push(error.to_string());
        }
    }
}

/// Snapshot of the resync state reported to the status sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncStatus {
    pub phase: ResyncPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub kinds: Vec<KindSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for ResyncStatus {
    fn default() -> Self {
        Self::idle()
    }
}

impl ResyncStatus {
    pub fn idle() -> Self {
        Self {
            phase: ResyncPhase::Idle,
            started_at: None,
            finished_at: None,
            kinds: Vec::new(),
            error: None,
        }
    }

    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            phase: ResyncPhase::Running,
            started_at: Some(started_at),
            ..Self::idle()
        }
    }

    /// Final status: FAILED if any kind failed, COMPLETED otherwise.
    pub fn finished(started_at: DateTime<Utc>, kinds: Vec<KindSummary>) -> Self {
        let failed: Vec<&str> = kinds
            .iter()
            .filter(|k| k.status == KindStatus::Failed)
            .map(|k| k.kind.as_str())
            .collect();
        let (phase, error) = if failed.is_empty() {
            (ResyncPhase::Completed, None)
        } else {
            (
                ResyncPhase::Failed,
                Some(format!("failed kinds: {}", failed.join(", "))),
            )
        };
        Self {
            phase,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            kinds,
            error,
        }
    }

    /// Pass that failed before any kind ran (e.g. mapping could not load).
    pub fn aborted(started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            phase: ResyncPhase::Failed,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            kinds: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn kind(&self, kind: &str) -> Option<&KindSummary> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}

/// Receives resync state transitions.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, status: &ResyncStatus);
}

/// Writes status transitions to the log.
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn report(&self, status: &ResyncStatus) {
        match status.phase {
            ResyncPhase::Idle => {}
            ResyncPhase::Running => info!("Resync running"),
            ResyncPhase::Completed => {
                for kind in &status.kinds {
                    info!(
                        kind = %kind.kind,
                        created = kind.created,
                        updated = kind.updated,
                        deleted = kind.deleted,
                        mapping_errors = kind.mapping_errors,
                        "Kind synced"
                    );
                }
                info!(kinds = status.kinds.len(), "Resync completed");
            }
            ResyncPhase::Failed => {
                for kind in status.kinds.iter().filter(|k| k.status == KindStatus::Failed) {
                    error!(
                        kind = %kind.kind,
                        error = kind.error.as_deref().unwrap_or("unknown"),
                        failed_entities = kind.failed.len(),
                        "Kind failed"
                    );
                }
                error!(
                    error = status.error.as_deref().unwrap_or("unknown"),
                    "Resync failed"
                );
            }
        }
    }
}

/// Reports status to the catalog's integration endpoint. Reporting failures
/// are logged and never fail the resync.
pub struct CatalogStatusSink {
    catalog: Arc<dyn CatalogClient>,
    integration: String,
}

impl CatalogStatusSink {
    pub fn new(catalog: Arc<dyn CatalogClient>, integration: impl Into<String>) -> Self {
        Self {
            catalog,
            integration: integration.into(),
        }
    }
}

#[async_trait]
impl StatusSink for CatalogStatusSink {
    async fn report(&self, status: &ResyncStatus) {
        if let Err(e) = self
            .catalog
            .report_resync_state(&self.integration, status)
            .await
        {
            warn!(
                integration = %self.integration,
                phase = ?status.phase,
                error = %e,
                "Failed to report resync state"
            );
        }
    }
}

/// Forwards to several sinks in order.
pub struct CompositeStatusSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl CompositeStatusSink {
    pub fn new(sinks: Vec<Arc<dyn StatusSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl StatusSink for CompositeStatusSink {
    async fn report(&self, status: &ResyncStatus) {
        for sink in &self.sinks {
            sink.report(status).await;
        }
    }
}
