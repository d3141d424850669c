//! Reference-counted, self-renewing wake locks.
//!
//! A [`WakeLockManager`] owns exactly one [`OsWakeLock`] and hands out any
//! number of named [`WakeLock`] handles that multiplex onto it. The OS lock
//! is held exactly while at least one handle is held:
//!
//! - the first handle acquired takes the OS lock and starts a renewal timer;
//! - while any handle is held the OS lock is re-requested every
//!   `lock_duration`, each request carrying a timeout of
//!   `lock_duration + safety_margin`;
//! - the last handle released cancels the renewal timer and drops the OS lock.
//!
//! If the renewal timer itself is lost (the process is frozen or its timer
//! thread killed), the OS drops the lock once the safety margin runs out, so
//! a stuck process cannot hold the device awake forever.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::WakeLockConfig;
use crate::error::Result;
use crate::executor::{Executor, ThreadExecutor};
use crate::platform::OsWakeLock;
use crate::timer::{LocalTimer, TimerHandle};

#[derive(Debug, Default)]
struct LockState {
    held_count: usize,
    // Bumped on every 0→1 transition so renewals armed for an earlier hold
    // period recognise themselves as stale.
    generation: u64,
    renewal: Option<TimerHandle>,
    acquired_at: Option<Timestamp>,
}

struct SharedWakeLock {
    tag: String,
    os_lock: Box<dyn OsWakeLock>,
    timer: Arc<dyn LocalTimer>,
    clock: Arc<dyn Clock>,
    lock_duration: Duration,
    safety_margin: Duration,
    state: Mutex<LockState>,
}

impl SharedWakeLock {
    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn os_timeout(&self) -> Duration {
        self.lock_duration.saturating_add(self.safety_margin)
    }

    fn acquire(self: &Arc<Self>) -> Result<()> {
        let mut state = self.lock_state();
        if state.held_count == 0 {
            // The count is only bumped once the OS lock is ours, so a failed
            // acquisition leaves nothing to roll back.
            self.os_lock.acquire(self.os_timeout())?;
            state.generation = state.generation.wrapping_add(1);
            state.acquired_at = Some(self.clock.now());
            state.renewal = Some(self.schedule_renewal(state.generation));
            debug!(tag = %self.tag, "wake lock acquired");
        }
        state.held_count += 1;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.lock_state();
        match state.held_count {
            0 => warn!(tag = %self.tag, "wake lock released more times than acquired"),
            1 => {
                state.held_count = 0;
                if let Some(renewal) = state.renewal.take() {
                    renewal.cancel();
                }
                self.os_lock.release();
                let held_ms = state
                    .acquired_at
                    .take()
                    .map(|at| self.clock.now().saturating_duration_since(at).as_millis())
                    .unwrap_or_default();
                debug!(tag = %self.tag, held_ms, "wake lock released");
            }
            _ => state.held_count -= 1,
        }
    }

    fn renew(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock_state();
        if state.held_count == 0 || state.generation != generation {
            return;
        }
        let held_ms = state
            .acquired_at
            .map(|at| self.clock.now().saturating_duration_since(at).as_millis())
            .unwrap_or_default();
        info!(tag = %self.tag, held_ms, holders = state.held_count, "renewing wake lock");
        if let Err(e) = self.os_lock.acquire(self.os_timeout()) {
            // The previous request still runs until its safety margin; try
            // again at the next renewal.
            warn!(tag = %self.tag, "cannot renew wake lock: {e}");
        }
        state.renewal = Some(self.schedule_renewal(generation));
    }

    fn schedule_renewal(self: &Arc<Self>, generation: u64) -> TimerHandle {
        let weak = Arc::downgrade(self);
        self.timer.after(
            self.lock_duration,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.renew(generation);
                }
            }),
        )
    }
}

/// Coordinator for the process's wake locks.
///
/// Cloning is cheap; clones share the same underlying OS lock.
#[derive(Clone)]
pub struct WakeLockManager {
    shared: Arc<SharedWakeLock>,
}

impl WakeLockManager {
    /// Take ownership of `os_lock` and coordinate access to it.
    ///
    /// `timer` drives renewals and `clock` is used for diagnostics.
    pub fn new(
        os_lock: Box<dyn OsWakeLock>,
        timer: Arc<dyn LocalTimer>,
        clock: Arc<dyn Clock>,
        config: &WakeLockConfig,
    ) -> Self {
        Self {
            shared: Arc::new(SharedWakeLock {
                tag: config.tag.clone(),
                os_lock,
                timer,
                clock,
                lock_duration: config.lock_duration(),
                safety_margin: config.safety_margin(),
                state: Mutex::new(LockState::default()),
            }),
        }
    }

    /// Create an idle handle labelled `tag`.
    pub fn create_wake_lock(&self, tag: impl Into<String>) -> WakeLock {
        WakeLock {
            tag: tag.into(),
            shared: Arc::clone(&self.shared),
            held: Mutex::new(false),
        }
    }

    /// Number of handles currently held.
    pub fn held_count(&self) -> usize {
        self.shared.lock_state().held_count
    }

    /// Returns `true` while the underlying OS lock is held.
    pub fn is_held(&self) -> bool {
        self.held_count() > 0
    }

    /// Run `action` on the calling thread while holding a wake lock.
    ///
    /// The lock is released when `action` returns or unwinds.
    ///
    /// # Errors
    ///
    /// Returns an error, without running `action`, if the wake lock cannot be
    /// acquired.
    pub fn run_wakefully<T>(&self, action: impl FnOnce() -> T, tag: &str) -> Result<T> {
        let _guard = self.create_wake_lock(tag).hold()?;
        Ok(action())
    }

    /// Hand `action` to `executor` while holding a wake lock until it
    /// finishes.
    ///
    /// The lock is released exactly once: after `action` returns or unwinds
    /// on the executor's thread, or immediately if the executor rejects it.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake lock cannot be acquired or the executor
    /// rejects the job. No lock is held after an error.
    pub fn execute_wakefully(
        &self,
        action: impl FnOnce() + Send + 'static,
        executor: &dyn Executor,
        tag: &str,
    ) -> Result<()> {
        let guard = self.create_wake_lock(tag).hold()?;
        // A rejected job is dropped inside `execute`, taking the guard with it.
        executor.execute(Box::new(move || {
            let _guard = guard;
            action();
        }))
    }

    /// Run `action` on a new thread named after `tag` while holding a wake
    /// lock until it finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake lock cannot be acquired or the thread
    /// cannot be spawned.
    pub fn spawn_wakefully(&self, action: impl FnOnce() + Send + 'static, tag: &str) -> Result<()> {
        self.execute_wakefully(action, &ThreadExecutor::new(tag), tag)
    }
}

/// A named handle onto the shared wake lock.
///
/// Each handle contributes at most one to the shared hold count: acquiring a
/// held handle or releasing an idle one is ignored. Dropping a held handle
/// releases it.
pub struct WakeLock {
    tag: String,
    shared: Arc<SharedWakeLock>,
    held: Mutex<bool>,
}

impl WakeLock {
    /// Diagnostic label.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns `true` between a successful [`acquire`](Self::acquire) and the
    /// matching [`release`](Self::release).
    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hold the wake lock.
    ///
    /// # Errors
    ///
    /// Returns an error if this is the first holder and the OS lock cannot be
    /// acquired; the handle stays idle.
    pub fn acquire(&self) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if *held {
            debug!(tag = %self.tag, "wake lock already acquired");
            return Ok(());
        }
        self.shared.acquire()?;
        *held = true;
        Ok(())
    }

    /// Stop holding the wake lock.
    pub fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !*held {
            debug!(tag = %self.tag, "wake lock already released");
            return;
        }
        *held = false;
        self.shared.release();
    }

    /// Acquire and return a guard that releases on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake lock cannot be acquired.
    pub fn hold(self) -> Result<WakeLockGuard> {
        self.acquire()?;
        Ok(WakeLockGuard { lock: self })
    }
}

impl Drop for WakeLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Scoped hold on a [`WakeLock`], released when dropped (including while
/// unwinding).
pub struct WakeLockGuard {
    lock: WakeLock,
}

impl WakeLockGuard {
    /// Diagnostic label of the held handle.
    pub fn tag(&self) -> &str {
        self.lock.tag()
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}
