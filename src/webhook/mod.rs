//! Live event pipeline: ingress router, bounded queue, worker pool and the
//! processor registry the dispatcher routes through.

pub mod dispatcher;
pub mod hook;
pub mod ingress;
pub mod processor;
pub mod queue;
pub mod registry;

pub use dispatcher::{EventDispatcher, EventOutcome};
pub use hook::{ErrorHook, LoggingErrorHook};
pub use ingress::{create_router, IngressState};
pub use processor::{ProcessError, RawUpdate, WebhookProcessor};
pub use queue::{EnqueueError, LiveEventQueue};
pub use registry::ProcessorRegistry;
