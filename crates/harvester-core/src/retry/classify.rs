//! Map transport errors and HTTP statuses onto retry kinds.

use super::error::TransportError;
use super::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
pub fn classify_http_status(code: u16) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code),
        _ => ErrorKind::Permanent,
    }
}

/// Classify one transport failure.
pub fn classify(e: &TransportError) -> ErrorKind {
    match e {
        TransportError::Timeout => ErrorKind::Timeout,
        TransportError::Connection(_) => ErrorKind::Connection,
        TransportError::Http(code) => classify_http_status(*code),
        TransportError::Other(_) => ErrorKind::Permanent,
    }
}
