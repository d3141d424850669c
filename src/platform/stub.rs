//! No-op wake lock for hosts without a sleep-inhibit service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use super::OsWakeLock;
use crate::error::Result;

/// Stub wake lock that inhibits nothing.
///
/// Used where the host does not suspend processes (servers, containers) or
/// offers no inhibit API. It still tracks whether it would be held so the
/// reference counting above it can be observed.
#[derive(Debug)]
pub struct StubWakeLock {
    tag: String,
    held: AtomicBool,
}

impl StubWakeLock {
    /// Create a stub labelled `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            held: AtomicBool::new(false),
        }
    }

    /// Returns `true` between `acquire` and `release`.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl OsWakeLock for StubWakeLock {
    fn acquire(&self, timeout: Duration) -> Result<()> {
        debug!(tag = %self.tag, timeout_ms = timeout.as_millis(), "stub wake lock acquired");
        self.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            debug!(tag = %self.tag, "stub wake lock released");
        }
    }
}
