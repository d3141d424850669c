//! Wakeful: a wake-aware task scheduler.
//!
//! Schedules one-off and fixed-delay tasks against a boot-relative clock on
//! hosts that may suspend at any time.
//!
//! # Architecture
//!
//! - **Queue**: due-time ordered, cancellable entries
//! - **Local timer**: fast, precise due checks that stop during suspension
//! - **Backstop alarm**: coarse OS wake-ups fenced by process identity
//! - **Wake locks**: reference-counted, self-renewing holds on one OS lock,
//!   kept from the sweep through each task's handoff to its executor

pub mod alarm;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod platform;
pub mod runtime;
pub mod scheduler;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod timer;
pub mod wake_lock;

pub use config::WakefulConfig;
pub use error::{Result, WakefulError};
pub use lifecycle::Service;
pub use runtime::WakefulRuntime;
pub use scheduler::{Cancellable, Scheduler};
pub use wake_lock::{WakeLock, WakeLockManager};
