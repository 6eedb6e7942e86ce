//! Classified results of a fetch with retries.

use crate::retry::{classify, ErrorKind, TransportError};

/// Terminal classification of one resource fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Success(T),
    /// Every allowed attempt failed with a transient error.
    Retryable { reason: String },
    /// A permanent error (4xx, bad URL, repeated integrity failure, disk error).
    Fatal { reason: String },
}

/// Outcome plus the bookkeeping the pipeline records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport<T> {
    pub outcome: FetchOutcome<T>,
    /// Attempts made, first one included.
    pub attempts: u32,
    /// Throttled (429/503) responses seen.
    pub throttle_events: u32,
    /// Last HTTP status observed, success or not.
    pub last_status: Option<u16>,
}

impl<T> FetchReport<T> {
    pub fn retries_used(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, FetchOutcome::Success(_))
    }

    /// Failure text, if not a success.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            FetchOutcome::Success(_) => None,
            FetchOutcome::Retryable { reason } | FetchOutcome::Fatal { reason } => Some(reason),
        }
    }
}

/// Image written to its destination and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub sha256: String,
    pub size_bytes: u64,
    pub status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptKind {
    Transport(ErrorKind),
    /// Zero-byte body or on-disk hash mismatch: retried once.
    Integrity,
    /// Local write failure: never retried.
    Storage,
}

/// Failure of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttemptError {
    pub(crate) kind: AttemptKind,
    pub(crate) message: String,
    pub(crate) status: Option<u16>,
}

impl AttemptError {
    pub(crate) fn integrity(message: impl Into<String>, status: u16) -> Self {
        Self {
            kind: AttemptKind::Integrity,
            message: message.into(),
            status: Some(status),
        }
    }

    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self {
            kind: AttemptKind::Storage,
            message: message.into(),
            status: None,
        }
    }
}

impl From<TransportError> for AttemptError {
    fn from(e: TransportError) -> Self {
        Self {
            kind: AttemptKind::Transport(classify(&e)),
            status: e.http_status(),
            message: e.to_string(),
        }
    }
}
