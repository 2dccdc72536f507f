use super::processor::WebhookProcessor;
use crate::event::LiveEvent;
use std::collections::BTreeSet;
use std::sync::Arc;

struct Registration {
    route: String,
    processor: Arc<dyn WebhookProcessor>,
}

/// Processors by ingress route.
///
/// Built once at startup; read-only afterwards.
#[derive(Default)]
pub struct ProcessorRegistry {
    registrations: Vec<Registration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, route: impl Into<String>, processor: Arc<dyn WebhookProcessor>) {
        self.registrations.push(Registration {
            route: route.into(),
            processor,
        });
    }

    /// Processors on the event's route whose predicate accepts it, in
    /// registration order.
    pub fn matching(&self, event: &LiveEvent) -> Vec<Arc<dyn WebhookProcessor>> {
        self.registrations
            .iter()
            .filter(|r| r.route == event.route && r.processor.should_process(event))
            .map(|r| Arc::clone(&r.processor))
            .collect()
    }

    pub fn routes(&self) -> BTreeSet<&str> {
        self.registrations.iter().map(|r| r.route.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
