//! Boot-relative monotonic time.
//!
//! Every due time in the scheduler is a [`Timestamp`] measured from boot, so
//! wall-clock adjustments never move a task earlier or later. On Linux and
//! Android [`SystemClock`] reads `CLOCK_BOOTTIME`, which keeps counting while
//! the device is suspended; elsewhere it falls back to a process-anchored
//! [`std::time::Instant`].

use std::fmt;
use std::time::Duration;

/// A point on the boot-relative monotonic timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The origin of the timeline.
    pub const ZERO: Self = Self(Duration::ZERO);

    /// Build a timestamp from an offset since boot.
    #[must_use]
    pub const fn from_duration(since_boot: Duration) -> Self {
        Self(since_boot)
    }

    /// Build a timestamp from milliseconds since boot.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Offset since boot.
    #[must_use]
    pub const fn since_boot(self) -> Duration {
        self.0
    }

    /// Milliseconds since boot, saturating at `u64::MAX`.
    #[must_use]
    pub fn as_millis(self) -> u64 {
        u64::try_from(self.0.as_millis()).unwrap_or(u64::MAX)
    }

    /// `self + delay`, or `None` on overflow.
    #[must_use]
    pub fn checked_add(self, delay: Duration) -> Option<Self> {
        self.0.checked_add(delay).map(Self)
    }

    /// `self + delay`, clamped to the end of the timeline.
    #[must_use]
    pub fn saturating_add(self, delay: Duration) -> Self {
        Self(self.0.saturating_add(delay))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}

/// Source of boot-relative monotonic time.
pub trait Clock: Send + Sync {
    /// Current time; never decreases between calls.
    fn now(&self) -> Timestamp;
}

/// The host's boot-relative clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(boot_time())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn boot_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if rc != 0 {
        return process_time();
    }
    let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
    let nanos = u32::try_from(ts.tv_nsec).unwrap_or(0);
    Duration::new(secs, nanos)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn boot_time() -> Duration {
    process_time()
}

// CLOCK_BOOTTIME has been available since Linux 2.6.39, so on Linux this is
// only reached on exotic kernels.
fn process_time() -> Duration {
    static ANCHOR: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    ANCHOR.get_or_init(std::time::Instant::now).elapsed()
}
