//! Platform sleep-inhibiting locks.
//!
//! Provides the [`OsWakeLock`] trait for the single underlying lock that
//! keeps the host awake. On Linux hosts with systemd this holds a
//! `systemd-inhibit` sleep inhibitor; everywhere else a no-op stub is used.

use std::time::Duration;

use crate::error::Result;

#[cfg(target_os = "linux")]
mod linux;
mod stub;

#[cfg(target_os = "linux")]
pub use linux::SystemdInhibitLock;
pub use stub::StubWakeLock;

/// The OS lock that prevents the host from suspending.
///
/// The lock is not reference counted: [`acquire`](OsWakeLock::acquire) on a
/// held lock replaces its timeout, and a single [`release`](OsWakeLock::release)
/// drops it. Reference counting is layered on top by
/// [`WakeLockManager`](crate::wake_lock::WakeLockManager).
pub trait OsWakeLock: Send + Sync {
    /// Hold the lock for at most `timeout`, after which the OS drops it
    /// even if [`release`](OsWakeLock::release) is never called.
    ///
    /// # Errors
    ///
    /// Returns [`WakefulError::WakeLock`](crate::error::WakefulError::WakeLock)
    /// if the OS refuses the lock.
    fn acquire(&self, timeout: Duration) -> Result<()>;

    /// Drop the lock. Releasing an unheld lock is a no-op.
    fn release(&self);
}

/// Create the platform-appropriate OS wake lock labelled `tag`.
///
/// Returns a `systemd-inhibit` lock on Linux when the binary is on `PATH`,
/// or a no-op stub otherwise.
pub fn create_os_wake_lock(tag: &str) -> Box<dyn OsWakeLock> {
    #[cfg(target_os = "linux")]
    {
        if let Some(lock) = SystemdInhibitLock::discover(tag) {
            return Box::new(lock);
        }
    }
    Box::new(StubWakeLock::new(tag))
}
