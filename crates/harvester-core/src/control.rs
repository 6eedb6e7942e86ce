//! Process-level stop signal.
//!
//! The CLI (Ctrl-C) or any embedding UI holds a clone and calls
//! [`StopSignal::request_stop`]; the pipeline stops scheduling new pages and
//! images, lets claimed work finish, and leaves the job `running` so the next
//! run resumes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let a = StopSignal::new();
        let b = a.clone();
        assert!(!b.is_stopped());
        a.request_stop();
        assert!(b.is_stopped());
    }
}
