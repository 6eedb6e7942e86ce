//! Transport-level failure of a single fetch attempt.

use std::fmt;

/// Error returned by one page or image transport call (curl, browser, HTTP status).
/// Kept closed so the downloader can classify it before deciding on a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The attempt exceeded its timeout.
    Timeout,
    /// Network-level failure: refused, reset, DNS, short read.
    Connection(String),
    /// The server answered with a non-2xx status.
    Http(u16),
    /// Anything else (bad URL, browser process failure, local IO).
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "timed out"),
            TransportError::Connection(msg) => write!(f, "connection: {}", msg),
            TransportError::Http(code) => write!(f, "HTTP {}", code),
            TransportError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            TransportError::Http(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<curl::Error> for TransportError {
    fn from(e: curl::Error) -> Self {
        if e.is_operation_timedout() {
            return TransportError::Timeout;
        }
        if e.is_couldnt_connect()
            || e.is_couldnt_resolve_host()
            || e.is_couldnt_resolve_proxy()
            || e.is_read_error()
            || e.is_recv_error()
            || e.is_send_error()
            || e.is_got_nothing()
            || e.is_partial_file()
        {
            return TransportError::Connection(e.to_string());
        }
        TransportError::Other(e.to_string())
    }
}
