use crate::status::ResyncStatus;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;

/// A resync pass is already running for this integration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyRunning;

impl fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a resync is already running")
    }
}

impl std::error::Error for AlreadyRunning {}

/// Per-instance resync state: the running flag and the last reported status.
///
/// Created once per integration instance and shared by the scheduler, the
/// management API and the coordinator.
#[derive(Debug)]
pub struct ResyncState {
    running: AtomicBool,
    last: RwLock<ResyncStatus>,
    idle: Notify,
}

impl Default for ResyncState {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            last: RwLock::new(ResyncStatus::idle()),
            idle: Notify::new(),
        }
    }
}

impl ResyncState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the running flag. The returned guard releases it on drop.
    pub fn try_start(self: &Arc<Self>) -> Result<RunGuard, AlreadyRunning> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AlreadyRunning)?;
        Ok(RunGuard {
            state: Arc::clone(self),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wait until no pass is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if !self.is_running() {
                return;
            }
            idle.await;
        }
    }

    pub fn last_status(&self) -> ResyncStatus {
        self.last.read().unwrap().clone()
    }

    pub(crate) fn set_status(&self, status: ResyncStatus) {
        *self.last.write().unwrap() = status;
    }
}

/// Proof that the holder owns the running flag.
#[derive(Debug)]
pub struct RunGuard {
    state: Arc<ResyncState>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        self.state.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_start_rejected_until_guard_dropped() {
        let state = ResyncState::new();
        let guard = state.try_start().unwrap();
        assert!(state.is_running());
        assert_eq!(state.try_start().unwrap_err(), AlreadyRunning);

        drop(guard);
        assert!(!state.is_running());
        assert!(state.try_start().is_ok());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_guard_dropped() {
        let state = ResyncState::new();
        state.wait_idle().await;

        let guard = state.try_start().unwrap();
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_one() {
        let state = ResyncState::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = Arc::clone(&state);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                state.try_start().ok()
            }));
        }

        let mut guards = Vec::new();
        for handle in handles {
            if let Some(guard) = handle.await.unwrap() {
                guards.push(guard);
            }
        }
        assert_eq!(guards.len(), 1);
    }
}
