use std::time::Duration;

/// Retry classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Attempt timed out (connect/read).
    Timeout,
    /// Server asked us to slow down (429, 503).
    Throttled,
    /// Network-level failure (connection reset, DNS, etc.).
    Connection,
    /// Retryable 5xx that is not throttling.
    Http5xx(u16),
    /// Client errors, malformed requests: never retried.
    Permanent,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }

    /// Whether the limiter should slow down after this failure.
    pub fn is_throttle(self) -> bool {
        matches!(self, ErrorKind::Throttled)
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff with a cap, bounded by a total attempt count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy allowing `retries` retries after the first attempt.
    pub fn with_retries(retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            base_delay,
            max_delay,
        }
    }

    /// Backoff after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// Decide what to do after failed attempt `attempt` (1-based).
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts || !kind.is_retryable() {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.backoff(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy::with_retries(retries, Duration::from_millis(500), Duration::from_secs(8))
    }

    #[test]
    fn no_retry_for_permanent() {
        assert_eq!(policy(3).decide(1, ErrorKind::Permanent), RetryDecision::NoRetry);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy(20);
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_secs(1));
        assert_eq!(p.backoff(3), Duration::from_secs(2));
        assert_eq!(p.backoff(5), Duration::from_secs(8));
        assert_eq!(p.backoff(40), Duration::from_secs(8));
        for attempt in 1..20 {
            match p.decide(attempt, ErrorKind::Timeout) {
                RetryDecision::RetryAfter(d) => assert!(d <= p.max_delay),
                RetryDecision::NoRetry => panic!("expected retry at {}", attempt),
            }
        }
    }

    #[test]
    fn attempts_are_retries_plus_one() {
        let p = policy(2);
        assert_eq!(p.max_attempts, 3);
        assert!(matches!(
            p.decide(1, ErrorKind::Throttled),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            p.decide(2, ErrorKind::Http5xx(502)),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(p.decide(3, ErrorKind::Throttled), RetryDecision::NoRetry);
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        assert_eq!(policy(0).decide(1, ErrorKind::Timeout), RetryDecision::NoRetry);
    }
}
