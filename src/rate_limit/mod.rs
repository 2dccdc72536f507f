// Outbound rate limiting.
//
// One limiter per external API target, shared by resync batches and live-event
// workers. Concurrency is bounded by a semaphore, rate by a token bucket, and
// server-provided quota headers can pause the bucket until the quota resets.

use crate::config::RateLimitConfig;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Token bucket with an optional hard pause.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    blocked_until: Option<Instant>,
    last_refill: Instant,
}

impl TokenBucket {
    /// A non-positive rate disables rate limiting (bucket never drains).
    fn new(requests_per_second: f64) -> Self {
        let (capacity, refill_rate) = if requests_per_second > 0.0 {
            (requests_per_second.max(1.0), requests_per_second)
        } else {
            (f64::INFINITY, f64::INFINITY)
        };
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            blocked_until: None,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Returns how long to wait if none is available.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Err(until - now);
            }
            self.blocked_until = None;
        }

        if self.refill_rate.is_infinite() {
            return Ok(());
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }

    fn pause_until(&mut self, until: Instant) {
        self.blocked_until = Some(match self.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

/// Quota information reported by the server on a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerRateLimit {
    /// Total requests allowed in the current window
    pub limit: Option<u64>,
    /// Requests left in the current window
    pub remaining: Option<u64>,
    /// Time until the window resets
    pub reset_after: Option<Duration>,
    /// Explicit back-off requested by the server (429 / Retry-After)
    pub retry_after: Option<Duration>,
}

/// Limiter errors
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitError {
    /// The limiter was shut down; no further requests are admitted.
    Closed,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::Closed => write!(f, "rate limiter closed"),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Held for the duration of one outbound request. Dropping it frees the slot.
pub struct RateLimitGuard {
    _permit: OwnedSemaphorePermit,
}

/// Concurrency guard + token bucket for a single API target.
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
    max_concurrent: usize,
    safety_margin: f64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            bucket: Mutex::new(TokenBucket::new(config.requests_per_second)),
            max_concurrent,
            safety_margin: config.safety_margin.clamp(0.0, 1.0),
        }
    }

    /// Wait for a concurrency slot and a rate token.
    ///
    /// The slot is taken first so waiting callers do not hoard tokens.
    pub async fn acquire(&self) -> Result<RateLimitGuard, RateLimitError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RateLimitError::Closed)?;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                bucket.try_acquire(Instant::now()).err()
            };

            match wait {
                None => return Ok(RateLimitGuard { _permit: permit }),
                Some(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting for token");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Adjust throughput from server quota headers.
    ///
    /// Pauses the bucket when the server asks for it explicitly, or when the
    /// remaining quota falls inside the configured safety margin.
    pub fn observe(&self, server: &ServerRateLimit) {
        if let Some(retry_after) = server.retry_after {
            self.pause(retry_after);
            return;
        }

        if let (Some(remaining), Some(reset_after)) = (server.remaining, server.reset_after) {
            let reserve = server
                .limit
                .map(|limit| (limit as f64 * self.safety_margin).ceil() as u64)
                .unwrap_or(0);
            if remaining <= reserve {
                info!(
                    remaining = remaining,
                    reserve = reserve,
                    reset_ms = reset_after.as_millis() as u64,
                    "Server quota nearly exhausted, pausing until reset"
                );
                self.pause(reset_after);
            }
        }
    }

    /// Block new requests for `duration`. Longer existing pauses are kept.
    pub fn pause(&self, duration: Duration) {
        let until = Instant::now() + duration;
        self.bucket.lock().unwrap().pause_until(until);
    }

    /// Stop admitting requests. Waiting callers receive `RateLimitError::Closed`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Requests currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }
}
