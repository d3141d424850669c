//! Local delayed-execution facility.
//!
//! The local timer is the fast wake-up path: cheap and precise while the
//! process is running, but it stops counting while the device is suspended
//! and dies with the process. The backstop alarm covers those gaps.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::executor::Job;

/// Handle to a pending local timer registration.
///
/// Dropping the handle does not cancel the registration.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Wrap a cancellation token the timer facility watches.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Best-effort prevent the callback from firing.
    ///
    /// A callback that has already started is not interrupted.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Schedules callbacks after a delay.
pub trait LocalTimer: Send + Sync {
    /// Run `callback` once, no earlier than `delay` from now.
    ///
    /// Implementations must not invoke `callback` before returning.
    fn after(&self, delay: Duration, callback: Job) -> TimerHandle;
}

/// Local timer backed by a tokio runtime.
///
/// Callbacks run on the runtime's blocking pool. Cancelling the `shutdown`
/// token abandons every pending registration at once.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: tokio::runtime::Handle,
    shutdown: CancellationToken,
}

impl TokioTimer {
    /// Create a timer on `handle` whose registrations die with `shutdown`.
    pub fn new(handle: tokio::runtime::Handle, shutdown: CancellationToken) -> Self {
        Self { handle, shutdown }
    }
}

impl LocalTimer for TokioTimer {
    fn after(&self, delay: Duration, callback: Job) -> TimerHandle {
        let token = self.shutdown.child_token();
        let watched = token.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = watched.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = tokio::task::spawn_blocking(callback).await {
                        warn!("local timer callback failed: {e}");
                    }
                }
            }
        });
        TimerHandle::new(token)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_after_delay() {
        let timer = TokioTimer::new(tokio::runtime::Handle::current(), CancellationToken::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _handle = timer.after(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        let fired = tokio::time::timeout(Duration::from_secs(5), rx).await;
        assert!(fired.is_ok(), "callback should fire");
    }

    #[tokio::test]
    async fn cancelled_registration_never_fires() {
        let timer = TokioTimer::new(tokio::runtime::Handle::current(), CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = timer.after(
            Duration::from_millis(50),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_registrations() {
        let shutdown = CancellationToken::new();
        let timer = TokioTimer::new(tokio::runtime::Handle::current(), shutdown.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = timer.after(
            Duration::from_millis(50),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        shutdown.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
