//! Full resync orchestration: producer → mapper → reconciliation, per kind.

pub mod coordinator;
pub mod state;

pub use coordinator::ResyncCoordinator;
pub use state::{AlreadyRunning, ResyncState, RunGuard};

use crate::error::SyncError;
use crate::mapping::CompiledResource;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;


/// Source of raw records for one integration.
///
/// For each configured resource the producer yields a finite stream of
/// record batches. An `Err` item ends the kind's pass as failed.
pub trait RawDataProducer: Send + Sync {
    fn batches<'a>(
        &'a self,
        resource: &'a CompiledResource,
    ) -> BoxStream<'a, Result<Vec<Value>, SyncError>>;
}

/// Producer serving fixed batches per kind.
#[derive(Debug, Default, Clone)]
pub struct StaticProducer {
    kinds: HashMap<String, Vec<Result<Vec<Value>, SyncError>>>,
}

impl StaticProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch(mut self, kind: &str, records: Vec<Value>) -> Self {
        self.kinds
            .entry(kind.to_string())
            .or_default()
            .push(Ok(records));
        self
    }

    /// After the batches added so far, fail `kind` with `error`.
    pub fn with_failure(mut self, kind: &str, error: SyncError) -> Self {
        self.kinds
            .entry(kind.to_string())
            .or_default()
            .push(Err(error));
        self
    }
}

impl RawDataProducer for StaticProducer {
    fn batches<'a>(
        &'a self,
        resource: &'a CompiledResource,
    ) -> BoxStream<'a, Result<Vec<Value>, SyncError>> {
        let batches = self.kinds.get(&resource.kind).cloned().unwrap_or_default();
        stream::iter(batches).boxed()
    }
}
