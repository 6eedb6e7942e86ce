//! Single-resource fetching under the shared rate limiter and retry policy.
//!
//! Every attempt takes one limiter token, runs the transport call under its
//! own timeout, and is classified. Transient failures back off
//! (`min(max, base * 2^(attempt-1))`) and retry up to the configured count;
//! permanent failures stop at once. The downloader never touches the state
//! store; callers turn the returned [`FetchReport`] into transitions.

mod outcome;

pub use outcome::{FetchOutcome, FetchReport, StoredImage};

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::checksum;
use crate::fetch::{FetchedPage, ImageTransport, PageFetcher};
use crate::rate_limit::RateLimiter;
use crate::retry::{ErrorKind, RetryDecision, RetryPolicy, TransportError};
use crate::storage;
use outcome::{AttemptError, AttemptKind};

#[derive(Clone)]
pub struct Downloader {
    limiter: Arc<RateLimiter>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Downloader {
    pub fn new(limiter: Arc<RateLimiter>, backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            limiter,
            backoff_base,
            backoff_max: backoff_max.max(backoff_base),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn policy(&self, retries: u32) -> RetryPolicy {
        RetryPolicy::with_retries(retries, self.backoff_base, self.backoff_max)
    }

    /// Fetch a page's HTML. An empty body counts as a transient failure.
    pub async fn fetch_page(
        &self,
        fetcher: &dyn PageFetcher,
        url: &str,
        retries: u32,
        timeout: Duration,
    ) -> FetchReport<FetchedPage> {
        self.run(retries, |_| async move {
            let page = with_timeout(timeout, fetcher.fetch_page(url, timeout)).await?;
            if page.html.trim().is_empty() {
                return Err(AttemptError {
                    kind: AttemptKind::Transport(ErrorKind::Connection),
                    message: "empty page body".to_string(),
                    status: Some(page.status),
                });
            }
            Ok(page)
        })
        .await
    }

    /// Fetch an image, write it to `dest` through a temp file, and verify the
    /// stored bytes against the hash of the received body.
    pub async fn fetch_image(
        &self,
        transport: &dyn ImageTransport,
        url: &str,
        dest: &Path,
        retries: u32,
        timeout: Duration,
    ) -> FetchReport<StoredImage> {
        self.run(retries, |_| {
            let dest = dest.to_path_buf();
            async move {
                let fetched = with_timeout(timeout, transport.fetch_bytes(url, timeout)).await?;
                if fetched.bytes.is_empty() {
                    return Err(AttemptError::integrity("empty image body", fetched.status));
                }
                let status = fetched.status;
                let expected = checksum::sha256_bytes(&fetched.bytes);
                let size_bytes = fetched.bytes.len() as u64;
                let stored = tokio::task::spawn_blocking(move || store_and_hash(&dest, &fetched.bytes))
                    .await
                    .map_err(|e| AttemptError::storage(format!("write task join: {}", e)))??;
                if stored != expected {
                    return Err(AttemptError::integrity(
                        format!("hash mismatch: expected {}, stored {}", expected, stored),
                        status,
                    ));
                }
                Ok(StoredImage {
                    sha256: expected,
                    size_bytes,
                    status,
                })
            }
        })
        .await
    }

    /// Attempt loop shared by pages and images.
    async fn run<T, F, Fut>(&self, retries: u32, mut attempt_fn: F) -> FetchReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
        T: HasStatus,
    {
        let policy = self.policy(retries);
        let mut attempt = 0u32;
        let mut throttle_events = 0u32;
        let mut integrity_seen = false;
        let mut last_status = None;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let err = match attempt_fn(attempt).await {
                Ok(value) => {
                    self.limiter.report_success();
                    return FetchReport {
                        last_status: Some(value.status()),
                        outcome: FetchOutcome::Success(value),
                        attempts: attempt,
                        throttle_events,
                    };
                }
                Err(e) => e,
            };
            last_status = err.status.or(last_status);

            // `transient` marks failures that would be retried if budget remained.
            let (decision, transient) = match err.kind {
                AttemptKind::Storage => (RetryDecision::NoRetry, false),
                AttemptKind::Integrity if integrity_seen => (RetryDecision::NoRetry, false),
                AttemptKind::Integrity => {
                    integrity_seen = true;
                    let decision = if attempt >= policy.max_attempts {
                        RetryDecision::NoRetry
                    } else {
                        RetryDecision::RetryAfter(policy.backoff(attempt))
                    };
                    (decision, true)
                }
                AttemptKind::Transport(kind) => {
                    if kind.is_throttle() {
                        throttle_events += 1;
                        self.limiter.report_throttled();
                    }
                    (policy.decide(attempt, kind), kind.is_retryable())
                }
            };

            match decision {
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(attempt, ?delay, error = %err.message, "retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::NoRetry => {
                    let outcome = if transient {
                        FetchOutcome::Retryable {
                            reason: format!("{} (after {} attempts)", err.message, attempt),
                        }
                    } else {
                        FetchOutcome::Fatal { reason: err.message }
                    };
                    return FetchReport {
                        outcome,
                        attempts: attempt,
                        throttle_events,
                        last_status,
                    };
                }
            }
        }
    }
}

/// Successful values carry the HTTP status they were served with.
trait HasStatus {
    fn status(&self) -> u16;
}

impl HasStatus for FetchedPage {
    fn status(&self) -> u16 {
        self.status
    }
}

impl HasStatus for StoredImage {
    fn status(&self) -> u16 {
        self.status
    }
}

async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, AttemptError>
where
    Fut: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res.map_err(AttemptError::from),
        Err(_) => Err(AttemptError::from(TransportError::Timeout)),
    }
}

fn store_and_hash(dest: &Path, bytes: &[u8]) -> Result<String, AttemptError> {
    storage::write_atomic(dest, bytes).map_err(|e| AttemptError::storage(format!("{:#}", e)))?;
    checksum::sha256_path(dest).map_err(|e| AttemptError::storage(format!("{:#}", e)))
}
