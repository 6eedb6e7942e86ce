//! Token bucket arithmetic, independent of any clock source or lock.

use std::time::Duration;
use tokio::time::Instant;

/// Multiplier applied to the refill rate when the server throttles us.
pub(super) const THROTTLE_FACTOR: f64 = 0.7;
/// Multiplier applied after a healthy recovery window.
pub(super) const RECOVERY_FACTOR: f64 = 1.1;
/// Healthy time required before the rate is raised again.
pub(super) const RECOVERY_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub(super) struct Bucket {
    pub(super) capacity: f64,
    pub(super) tokens: f64,
    /// Current refill rate in tokens per second.
    pub(super) rate: f64,
    pub(super) max_rate: f64,
    pub(super) min_rate: f64,
    pub(super) last_refill: Instant,
    pub(super) last_adjust: Instant,
}

impl Bucket {
    pub(super) fn new(rate: f64, burst: u32, now: Instant) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate,
            max_rate: rate,
            min_rate: rate.min(1.0),
            last_refill: now,
            last_adjust: now,
        }
    }

    /// Accumulate fractional tokens for the time elapsed since the last refill.
    pub(super) fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take one token, or return how long until one is available.
    pub(super) fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let shortage = 1.0 - self.tokens;
        Err(Duration::try_from_secs_f64(shortage / self.rate).unwrap_or(Duration::MAX))
    }

    pub(super) fn throttled(&mut self, now: Instant) {
        self.refill(now);
        self.rate = (self.rate * THROTTLE_FACTOR).max(self.min_rate);
        self.last_adjust = now;
    }

    pub(super) fn healthy(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_adjust) >= RECOVERY_WINDOW {
            self.refill(now);
            self.rate = (self.rate * RECOVERY_FACTOR).min(self.max_rate);
            self.last_adjust = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_drains() {
        let now = Instant::now();
        let mut b = Bucket::new(2.0, 3, now);
        assert!(b.try_take(now).is_ok());
        assert!(b.try_take(now).is_ok());
        assert!(b.try_take(now).is_ok());
        let wait = b.try_take(now).unwrap_err();
        assert_eq!(wait, Duration::from_millis(500));
    }

    #[test]
    fn refill_is_fractional_and_capped() {
        let now = Instant::now();
        let mut b = Bucket::new(4.0, 2, now);
        b.tokens = 0.0;
        b.refill(now + Duration::from_millis(125));
        assert!((b.tokens - 0.5).abs() < 1e-9);
        b.refill(now + Duration::from_secs(60));
        assert_eq!(b.tokens, 2.0);
    }

    #[test]
    fn throttle_has_floor_and_recovery_has_ceiling() {
        let now = Instant::now();
        let mut b = Bucket::new(5.0, 1, now);
        b.throttled(now);
        assert!((b.rate - 3.5).abs() < 1e-9);
        for _ in 0..50 {
            b.throttled(now);
        }
        assert_eq!(b.rate, 1.0);

        let mut t = now;
        for _ in 0..100 {
            t += RECOVERY_WINDOW;
            b.healthy(t);
        }
        assert_eq!(b.rate, 5.0);
    }

    #[test]
    fn recovery_waits_for_window() {
        let now = Instant::now();
        let mut b = Bucket::new(10.0, 1, now);
        b.throttled(now);
        let lowered = b.rate;
        b.healthy(now + Duration::from_secs(29));
        assert_eq!(b.rate, lowered);
        b.healthy(now + Duration::from_secs(30));
        assert!(b.rate > lowered);
    }

    #[test]
    fn slow_rate_floor_is_rate_itself() {
        let now = Instant::now();
        let mut b = Bucket::new(0.5, 1, now);
        b.throttled(now);
        assert_eq!(b.rate, 0.5);
    }

    #[test]
    fn tiny_rate_waits_instead_of_overflowing() {
        let now = Instant::now();
        let mut b = Bucket::new(1e-300, 1, now);
        assert!(b.try_take(now).is_ok());
        assert_eq!(b.try_take(now), Err(Duration::MAX));
    }
}
