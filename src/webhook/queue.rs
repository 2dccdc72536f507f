use super::dispatcher::EventDispatcher;
use crate::event::LiveEvent;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why an event could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity; the caller should retry later
    Full,
    /// Workers have shut down
    Closed,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full => write!(f, "event queue is full"),
            EnqueueError::Closed => write!(f, "event queue is closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Bounded queue of live events drained by a fixed pool of workers.
///
/// Enqueueing never waits: a full queue is reported to the caller at once.
/// Workers share one receiver, so each event is processed by exactly one
/// worker; order is only preserved per worker.
#[derive(Clone)]
pub struct LiveEventQueue {
    sender: mpsc::Sender<LiveEvent>,
}

impl LiveEventQueue {
    /// Spawn `workers` tasks feeding `dispatcher`. They stop when `cancel`
    /// fires; the in-flight event sees the same token.
    pub fn start(
        dispatcher: Arc<EventDispatcher>,
        workers: usize,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let dispatcher = Arc::clone(&dispatcher);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_worker(worker, receiver, dispatcher, cancel).await;
                })
            })
            .collect();

        info!(workers = workers.max(1), capacity = capacity.max(1), "Live event workers started");
        (Self { sender }, handles)
    }

    /// Queue an event without waiting.
    pub fn enqueue(&self, event: LiveEvent) -> Result<(), EnqueueError> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => {
                warn!(event_id = %event.id, route = %event.route, "Event queue full, rejecting event");
                EnqueueError::Full
            }
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Events waiting for a worker.
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<LiveEvent>>>,
    dispatcher: Arc<EventDispatcher>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            event = async { receiver.lock().await.recv().await } => event,
        };
        let Some(event) = next else {
            break;
        };

        debug!(worker = worker, event_id = %event.id, route = %event.route, "Dequeued event");
        let event_id = event.id;
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(&event, &cancel).await;
            })
        };
        // A panicking processor takes down its own task, never the worker
        if let Err(e) = task.await {
            error!(worker = worker, event_id = %event_id, error = %e, "Event dispatch panicked");
        }
    }
    debug!(worker = worker, "Live event worker stopped");
}
