use super::processor::ProcessError;
use crate::event::LiveEvent;
use async_trait::async_trait;
use tracing::error;

/// Receives live events that failed terminally.
///
/// Called once per (event, processor) failure, after retries are spent.
/// The webhook caller already got its 2xx, so this is the only place the
/// failure surfaces besides the logs.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(&self, event: &LiveEvent, processor: &str, error: &ProcessError);
}

/// Logs failed events.
pub struct LoggingErrorHook;

#[async_trait]
impl ErrorHook for LoggingErrorHook {
    async fn on_error(&self, event: &LiveEvent, processor: &str, err: &ProcessError) {
        error!(
            event_id = %event.id,
            route = %event.route,
            processor = %processor,
            stage = %err.stage,
            error = %err.error,
            "Live event failed"
        );
    }
}
