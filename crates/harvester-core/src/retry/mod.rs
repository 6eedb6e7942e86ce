//! Retry and backoff policy.
//!
//! Classifies transport failures (timeouts, throttling, connection errors,
//! HTTP statuses) and computes capped exponential backoff, so page and image
//! fetches share one consistent policy.

mod classify;
mod error;
mod policy;

pub use classify::{classify, classify_http_status};
pub use error::TransportError;
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
