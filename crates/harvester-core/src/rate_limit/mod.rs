//! Process-wide adaptive token bucket.
//!
//! One `RateLimiter` is shared (via `Arc`) by every page and image fetch of a
//! job. Waiters queue on a fair async mutex, so tokens are issued in FIFO
//! order; the bucket state itself sits behind a short-lived std mutex so
//! throttle/success reports never wait behind a sleeping acquirer.
//!
//! Retry backoff is not slept here: callers sleep between attempts without
//! holding a place in the queue.

mod bucket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use bucket::Bucket;

#[derive(Debug)]
pub struct RateLimiter {
    queue: tokio::sync::Mutex<()>,
    bucket: Mutex<Bucket>,
    throttle_events: AtomicU64,
}

impl RateLimiter {
    /// Limiter refilling at `requests_per_sec` with capacity `burst` (min 1).
    pub fn new(requests_per_sec: f64, burst: u32) -> Self {
        Self {
            queue: tokio::sync::Mutex::new(()),
            bucket: Mutex::new(Bucket::new(requests_per_sec, burst, Instant::now())),
            throttle_events: AtomicU64::new(0),
        }
    }

    fn bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Suspend until a token is available, then take it.
    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        loop {
            let wait = match self.bucket().try_take(Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        match self.queue.try_lock() {
            Ok(_turn) => self.bucket().try_take(Instant::now()).is_ok(),
            Err(_) => false,
        }
    }

    /// Report a throttled response (429/503): the refill rate drops ×0.7.
    pub fn report_throttled(&self) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
        let mut b = self.bucket();
        b.throttled(Instant::now());
        tracing::debug!(rate = b.rate, "rate limiter slowed down after throttling");
    }

    /// Report a healthy response; raises the rate ×1.1 once per recovery window.
    pub fn report_success(&self) {
        self.bucket().healthy(Instant::now());
    }

    /// Current refill rate in requests per second.
    pub fn current_rate(&self) -> f64 {
        self.bucket().rate
    }

    /// Bucket capacity (burst).
    pub fn capacity(&self) -> f64 {
        self.bucket().capacity
    }

    /// Throttle reports seen since construction.
    pub fn throttle_events(&self) -> u64 {
        self.throttle_events.load(Ordering::Relaxed)
    }
}
