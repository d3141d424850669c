//! Deterministic stand-ins for the platform seams.
//!
//! Time only moves when a test calls [`ManualClock::advance`], local timers
//! only fire from [`ManualTimer::fire_due`], and executors only run jobs from
//! [`DeferredExecutor::run_all`]. Together they make every interleaving in a
//! scheduler test explicit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::alarm::{AlarmRequest, BackstopAlarm};
use crate::clock::{Clock, Timestamp};
use crate::error::{Result, WakefulError};
use crate::executor::{Executor, Job};
use crate::platform::OsWakeLock;
use crate::timer::{LocalTimer, TimerHandle};

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    /// Start at [`Timestamp::ZERO`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = now.saturating_add(by);
    }

    /// Jump to `to`; ignored if `to` is in the past.
    pub fn set(&self, to: Timestamp) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if to > *now {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct TimerEntry {
    due: Timestamp,
    seq: u64,
    token: CancellationToken,
    callback: Job,
}

#[derive(Default)]
struct TimerState {
    entries: Vec<TimerEntry>,
    next_seq: u64,
}

/// Local timer driven by a [`ManualClock`]. Clones share registrations.
#[derive(Clone)]
pub struct ManualTimer {
    clock: ManualClock,
    state: Arc<Mutex<TimerState>>,
}

impl ManualTimer {
    /// Create a timer reading due times from `clock`.
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    fn take_next_due(&self) -> Option<Job> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.retain(|e| !e.token.is_cancelled());
        let index = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.due <= now)
            .min_by_key(|(_, e)| (e.due, e.seq))
            .map(|(i, _)| i)?;
        Some(state.entries.swap_remove(index).callback)
    }

    /// Run every uncancelled callback due at the current time, earliest
    /// first, including ones registered by callbacks fired in this call.
    /// Returns how many ran.
    pub fn fire_due(&self) -> usize {
        let mut fired = 0;
        // The state lock is released before each callback so callbacks can
        // register further timers.
        while let Some(callback) = self.take_next_due() {
            callback();
            fired += 1;
        }
        fired
    }

    /// Advance the clock by `by`, then [`fire_due`](Self::fire_due).
    pub fn advance_and_fire(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.fire_due()
    }

    /// Number of registrations that are neither fired nor cancelled.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .filter(|e| !e.token.is_cancelled())
            .count()
    }

    /// Earliest due time among pending registrations.
    pub fn next_due(&self) -> Option<Timestamp> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .filter(|e| !e.token.is_cancelled())
            .map(|e| e.due)
            .min()
    }
}

impl LocalTimer for ManualTimer {
    fn after(&self, delay: Duration, callback: Job) -> TimerHandle {
        let token = CancellationToken::new();
        let due = self.clock.now().saturating_add(delay);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(TimerEntry {
            due,
            seq,
            token: token.clone(),
            callback,
        });
        TimerHandle::new(token)
    }
}

#[derive(Debug, Default)]
struct AlarmLog {
    arms: Vec<AlarmRequest>,
    cancels: usize,
    fail_next_arm: bool,
}

/// Backstop alarm that records every request instead of scheduling it.
#[derive(Debug, Clone)]
pub struct RecordingAlarm {
    exact_supported: bool,
    log: Arc<Mutex<AlarmLog>>,
}

impl RecordingAlarm {
    /// Create a facility that does or does not offer exact-while-idle alarms.
    pub fn new(exact_supported: bool) -> Self {
        Self {
            exact_supported,
            log: Arc::new(Mutex::new(AlarmLog::default())),
        }
    }

    /// Every accepted [`arm`](BackstopAlarm::arm) request, oldest first.
    pub fn arms(&self) -> Vec<AlarmRequest> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .arms
            .clone()
    }

    /// Number of [`cancel`](BackstopAlarm::cancel) calls.
    pub fn cancels(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).cancels
    }

    /// Make the next `arm` call fail.
    pub fn fail_next_arm(&self) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_next_arm = true;
    }
}

impl BackstopAlarm for RecordingAlarm {
    fn supports_exact_while_idle(&self) -> bool {
        self.exact_supported
    }

    fn arm(&self, request: AlarmRequest) -> Result<()> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if std::mem::take(&mut log.fail_next_arm) {
            return Err(WakefulError::Alarm("alarm facility unavailable".to_owned()));
        }
        log.arms.push(request);
        Ok(())
    }

    fn cancel(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).cancels += 1;
    }
}

/// Something that happened to a [`FakeOsWakeLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsLockEvent {
    /// Successful acquire with the requested timeout.
    Acquire(Duration),
    /// Release of a held lock.
    Release,
}

#[derive(Debug, Default)]
struct FakeLockState {
    held: bool,
    events: Vec<OsLockEvent>,
    fail_next_acquire: bool,
}

/// OS wake lock that records its history. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeOsWakeLock {
    state: Arc<Mutex<FakeLockState>>,
}

impl FakeOsWakeLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the lock is currently held.
    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).held
    }

    /// Successful acquires and releases, oldest first.
    pub fn events(&self) -> Vec<OsLockEvent> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .clone()
    }

    /// Make the next `acquire` call fail.
    pub fn fail_next_acquire(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_next_acquire = true;
    }
}

impl OsWakeLock for FakeOsWakeLock {
    fn acquire(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if std::mem::take(&mut state.fail_next_acquire) {
            return Err(WakefulError::WakeLock("lock refused".to_owned()));
        }
        state.held = true;
        state.events.push(OsLockEvent::Acquire(timeout));
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.held {
            state.held = false;
            state.events.push(OsLockEvent::Release);
        }
    }
}

/// Executor that queues jobs until [`run_all`](Self::run_all) is called.
#[derive(Clone, Default)]
pub struct DeferredExecutor {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl DeferredExecutor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` if no job is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run queued jobs in submission order, including jobs they submit.
    /// Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self
                .jobs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(job) = next else {
                return ran;
            };
            job();
            ran += 1;
        }
    }
}

impl Executor for DeferredExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(job);
        Ok(())
    }
}

/// Executor that refuses every job.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectingExecutor;

impl Executor for RejectingExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        drop(job);
        Err(WakefulError::Executor("executor is shut down".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn manual_timer_fires_in_due_order() {
        let clock = ManualClock::new();
        let timer = ManualTimer::new(clock.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, delay) in [("late", 30), ("early", 10), ("mid", 20)] {
            let order = Arc::clone(&order);
            let _ = timer.after(
                Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(name)),
            );
        }

        assert_eq!(timer.fire_due(), 0);
        assert_eq!(timer.next_due(), Some(Timestamp::from_millis(10)));
        assert_eq!(timer.advance_and_fire(Duration::from_millis(25)), 2);
        assert_eq!(*order.lock().unwrap(), vec!["early", "mid"]);
        assert_eq!(timer.pending(), 1);
    }

    #[test]
    fn manual_timer_skips_cancelled() {
        let clock = ManualClock::new();
        let timer = ManualTimer::new(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = timer.after(
            Duration::ZERO,
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        assert_eq!(timer.pending(), 0);
        assert_eq!(timer.fire_due(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn manual_clock_never_goes_backwards() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_millis(100));
        clock.set(Timestamp::from_millis(50));
        assert_eq!(clock.now(), Timestamp::from_millis(100));
    }

    #[test]
    fn deferred_executor_runs_nested_submissions() {
        let executor = DeferredExecutor::new();
        let inner = executor.clone();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        executor
            .execute(Box::new(move || {
                let ran_inner = Arc::clone(&ran_clone);
                inner
                    .execute(Box::new(move || {
                        ran_inner.fetch_add(1, Ordering::SeqCst);
                    }))
                    .unwrap();
            }))
            .unwrap();
        assert_eq!(executor.run_all(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(executor.is_empty());
    }
}
