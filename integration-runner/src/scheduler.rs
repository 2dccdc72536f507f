//! Periodic resync scheduler.
//!
//! Runs one pass on start (optional), then one every interval. A tick that
//! lands while a pass is still running (scheduled or manual) is skipped.

use catalog_sync::resync::ResyncCoordinator;
use catalog_sync::status::ResyncPhase;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ResyncScheduler {
    coordinator: Arc<ResyncCoordinator>,
    /// `None` disables periodic passes
    every: Option<Duration>,
    on_start: bool,
}

impl ResyncScheduler {
    pub fn new(coordinator: Arc<ResyncCoordinator>, every: Option<Duration>, on_start: bool) -> Self {
        Self {
            coordinator,
            every,
            on_start,
        }
    }

    /// Scheduler for `resync_interval_minutes` (0 disables the schedule).
    pub fn from_minutes(coordinator: Arc<ResyncCoordinator>, minutes: u64, on_start: bool) -> Self {
        let every = (minutes > 0).then(|| Duration::from_secs(minutes * 60));
        Self::new(coordinator, every, on_start)
    }

    /// Spawn the scheduling loop. It stops when `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                integration = %self.coordinator.integration(),
                interval_secs = self.every.map(|d| d.as_secs()),
                on_start = self.on_start,
                "Starting resync scheduler"
            );

            if self.on_start {
                self.run_once(&cancel, "start").await;
            }

            let Some(every) = self.every else {
                debug!("Periodic resync disabled");
                return;
            };

            let mut ticks = interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticks.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => self.run_once(&cancel, "schedule").await,
                }
            }
            debug!("Resync scheduler stopped");
        })
    }

    async fn run_once(&self, cancel: &CancellationToken, trigger: &str) {
        if cancel.is_cancelled() {
            return;
        }
        match self.coordinator.trigger(cancel).await {
            Ok(status) if status.phase == ResyncPhase::Completed => {
                info!(trigger = %trigger, "Scheduled resync completed");
            }
            Ok(status) => {
                warn!(
                    trigger = %trigger,
                    phase = ?status.phase,
                    error = status.error.as_deref().unwrap_or(""),
                    "Scheduled resync did not complete"
                );
            }
            Err(e) => {
                info!(trigger = %trigger, reason = %e, "Skipping scheduled resync");
            }
        }
    }
}
