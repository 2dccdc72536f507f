use crate::error::SyncError;
use crate::event::{EventState, LiveEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Authoritative upstream state for the records an event touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawUpdate {
    /// Current records, mapped and upserted
    pub updated: Vec<Value>,
    /// Records gone upstream, mapped only to find what to delete
    pub deleted: Vec<Value>,
}

impl RawUpdate {
    pub fn updated(records: Vec<Value>) -> Self {
        Self {
            updated: records,
            deleted: Vec::new(),
        }
    }

    pub fn deleted(records: Vec<Value>) -> Self {
        Self {
            updated: Vec::new(),
            deleted: records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Handles one family of webhook events.
///
/// The dispatcher drives each matching processor through
/// authenticate → validate → fetch, then maps and applies the result itself.
#[async_trait]
pub trait WebhookProcessor: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Cheap predicate over event metadata (headers, action field).
    fn should_process(&self, event: &LiveEvent) -> bool;

    /// Kinds this event may change.
    fn matching_kinds(&self, event: &LiveEvent) -> Vec<String>;

    /// Verify the event came from the upstream system.
    async fn authenticate(&self, event: &LiveEvent) -> Result<(), SyncError>;

    /// Check the payload has the shape `fetch` relies on.
    async fn validate(&self, event: &LiveEvent) -> Result<(), SyncError>;

    /// Fetch the current upstream state behind the event for `kind`.
    /// Webhook payloads are often partial, so this goes back to the API.
    async fn fetch(&self, event: &LiveEvent, kind: &str) -> Result<RawUpdate, SyncError>;
}

/// A processor failure, tagged with the stage it happened in.
#[derive(Debug, Clone)]
pub struct ProcessError {
    pub stage: EventState,
    pub error: SyncError,
}

impl ProcessError {
    pub fn new(stage: EventState, error: SyncError) -> Self {
        Self { stage, error }
    }

    pub fn is_transient(&self) -> bool {
        self.error.is_transient()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, SyncError::Cancelled)
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for ProcessError {}
