//! The wake-aware scheduler engine.
//!
//! Every scheduled occurrence is reachable by two independent wake-up paths:
//!
//! 1. a local timer check armed for the occurrence's own delay, which is
//!    precise but stops while the device sleeps, and
//! 2. the backstop alarm, armed at service start and re-armed on every
//!    delivery, which is coarse but wakes the device.
//!
//! Whichever fires first runs a sweep: under one held wake lock, all due
//! occurrences are dequeued and handed to their executors, each wrapped in
//! its own wake lock that lasts until the action finishes.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{EntryId, TaskQueue};
use crate::alarm::{AlarmKind, AlarmPayload, AlarmRequest, BackstopAlarm, ProcessId};
use crate::clock::{Clock, Timestamp};
use crate::config::SchedulerConfig;
use crate::error::{Result, WakefulError};
use crate::executor::{Executor, Job};
use crate::lifecycle::Service;
use crate::timer::{LocalTimer, TimerHandle};
use crate::wake_lock::WakeLockManager;

const SWEEP_TAG: &str = "TaskScheduler";
const ALARM_TAG: &str = "TaskAlarm";
const HANDOFF_TAG: &str = "TaskHandoff";

/// Identifies a scheduled task (a one-off task or a whole fixed-delay series).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The platform facilities a [`Scheduler`] is built on.
pub struct Facilities {
    /// Boot-relative time source.
    pub clock: Arc<dyn Clock>,
    /// Fast-path local timer for due checks.
    pub timer: Arc<dyn LocalTimer>,
    /// OS-level backstop wake-up.
    pub alarm: Arc<dyn BackstopAlarm>,
    /// Coordinator every sweep and dispatch holds a lock from.
    pub wake_locks: WakeLockManager,
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Occurrences handed to their executors.
    pub dispatched: usize,
    /// Due occurrences dropped because their task was cancelled.
    pub skipped: usize,
    /// Executor submissions that failed; those occurrences did not run.
    pub dispatch_errors: Vec<WakefulError>,
}

/// What a backstop alarm delivery did.
#[derive(Debug)]
pub enum AlarmOutcome {
    /// The scheduler is not started; nothing happened.
    Ignored,
    /// The alarm was armed by another process incarnation. No task ran.
    Stale {
        /// Whether the next alarm was re-armed under this process's identity.
        rearmed: bool,
    },
    /// The alarm belonged to this process and a sweep ran.
    Handled {
        /// Whether the next alarm was re-armed.
        rearmed: bool,
        /// The sweep's result.
        report: SweepReport,
    },
}

struct Pending {
    entry: EntryId,
    check: TimerHandle,
}

/// State shared by every occurrence of one task.
struct Series {
    id: TaskId,
    cancelled: AtomicBool,
    pending: Mutex<Option<Pending>>,
}

impl Series {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_pending(&self, pending: Pending) {
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        // The check armed for `pending` may already have run it and queued
        // the next occurrence; never replace that with the older entry.
        if slot
            .as_ref()
            .is_some_and(|current| current.entry > pending.entry)
        {
            return;
        }
        *slot = Some(pending);
    }

    fn take_pending(&self) -> Option<Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

enum Action {
    Once(Job),
    Repeating {
        action: Arc<dyn Fn() + Send + Sync>,
        interval: Duration,
    },
}

struct Occurrence {
    series: Arc<Series>,
    action: Action,
    executor: Arc<dyn Executor>,
}

/// Handle returned by the scheduling calls.
///
/// Cancelling stops the task, or every remaining occurrence of a fixed-delay
/// series. An occurrence already running is not interrupted.
#[derive(Clone)]
pub struct Cancellable {
    series: Arc<Series>,
    scheduler: Weak<Inner>,
}

impl Cancellable {
    /// The task this handle controls.
    pub fn id(&self) -> TaskId {
        self.series.id
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.series.is_cancelled()
    }

    /// Stop the task.
    ///
    /// After this returns the task has either already finished, is already
    /// running, or will never start. Cancelling twice is harmless.
    pub fn cancel(&self) {
        self.series.cancelled.store(true, Ordering::SeqCst);
        match self.scheduler.upgrade() {
            Some(inner) => inner.withdraw(&self.series),
            None => {
                if let Some(pending) = self.series.take_pending() {
                    pending.check.cancel();
                }
            }
        }
        debug!(task = %self.series.id, "task cancelled");
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    timer: Arc<dyn LocalTimer>,
    alarm: Arc<dyn BackstopAlarm>,
    wake_locks: WakeLockManager,
    process_id: ProcessId,
    backstop_interval: Duration,
    prefer_exact_alarm: bool,
    queue: Mutex<TaskQueue<Occurrence>>,
    next_task_id: AtomicU64,
    // Some while the service is started.
    alarm_kind: Mutex<Option<AlarmKind>>,
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, TaskQueue<Occurrence>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_alarm_kind(&self) -> MutexGuard<'_, Option<AlarmKind>> {
        self.alarm_kind.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_series(&self) -> Arc<Series> {
        Arc::new(Series {
            id: TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed)),
            cancelled: AtomicBool::new(false),
            pending: Mutex::new(None),
        })
    }

    fn enqueue(
        self: &Arc<Self>,
        series: &Arc<Series>,
        action: Action,
        executor: Arc<dyn Executor>,
        delay: Duration,
    ) -> Result<()> {
        let due = self.clock.now().checked_add(delay).ok_or_else(|| {
            WakefulError::InvalidArgument(format!("delay of {delay:?} overflows the clock"))
        })?;
        let entry = self.lock_queue().push(
            due,
            Occurrence {
                series: Arc::clone(series),
                action,
                executor,
            },
        );
        let check = self.schedule_check(delay);
        series.set_pending(Pending { entry, check });
        // A cancel that raced with this enqueue may have missed the pending
        // entry; withdraw it here instead.
        if series.is_cancelled() {
            self.withdraw(series);
        }
        debug!(task = %series.id, %due, "task queued");
        Ok(())
    }

    fn withdraw(&self, series: &Series) {
        if let Some(pending) = series.take_pending() {
            pending.check.cancel();
            self.lock_queue().remove(pending.entry);
        }
    }

    fn schedule_check(self: &Arc<Self>, delay: Duration) -> TimerHandle {
        let weak = Arc::downgrade(self);
        self.timer.after(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    match inner.run_due_tasks() {
                        Ok(report) => {
                            for e in &report.dispatch_errors {
                                warn!("due task was not dispatched: {e}");
                            }
                        }
                        Err(e) => warn!("cannot run due tasks, waiting for backstop alarm: {e}"),
                    }
                }
            }),
        )
    }

    fn run_due_tasks(self: &Arc<Self>) -> Result<SweepReport> {
        self.wake_locks.run_wakefully(|| self.sweep(), SWEEP_TAG)
    }

    fn sweep(self: &Arc<Self>) -> SweepReport {
        let now = self.clock.now();
        let due = self.lock_queue().pop_due(now);
        let mut report = SweepReport::default();
        if due.is_empty() {
            debug!("no due tasks");
            return report;
        }
        info!(count = due.len(), "running due tasks");
        for (due_at, occurrence) in due {
            self.dispatch(occurrence, due_at, now, &mut report);
        }
        report
    }

    fn dispatch(
        self: &Arc<Self>,
        occurrence: Occurrence,
        due_at: Timestamp,
        now: Timestamp,
        report: &mut SweepReport,
    ) {
        let Occurrence {
            series,
            action,
            executor,
        } = occurrence;
        if series.is_cancelled() {
            debug!(task = %series.id, "skipping cancelled task");
            report.skipped += 1;
            return;
        }
        let overdue_ms = now.saturating_duration_since(due_at).as_millis();
        debug!(task = %series.id, overdue_ms, "dispatching task");

        let job: Job = match action {
            Action::Once(task) => {
                let series = Arc::clone(&series);
                Box::new(move || {
                    if !series.is_cancelled() {
                        run_isolated(series.id, task);
                    }
                })
            }
            Action::Repeating { action, interval } => {
                let weak = Arc::downgrade(self);
                let series = Arc::clone(&series);
                let next_executor = Arc::clone(&executor);
                Box::new(move || {
                    if series.is_cancelled() {
                        return;
                    }
                    run_isolated(series.id, || action());
                    // The next occurrence is queued from here rather than
                    // run in a loop, so the series never grows the stack.
                    if let Some(inner) = weak.upgrade() {
                        inner.resubmit(&series, action, next_executor, interval);
                    }
                })
            }
        };

        match self
            .wake_locks
            .execute_wakefully(job, executor.as_ref(), HANDOFF_TAG)
        {
            Ok(()) => report.dispatched += 1,
            Err(e) => {
                warn!(task = %series.id, "cannot dispatch task: {e}");
                report.dispatch_errors.push(e);
            }
        }
    }

    fn resubmit(
        self: &Arc<Self>,
        series: &Arc<Series>,
        action: Arc<dyn Fn() + Send + Sync>,
        executor: Arc<dyn Executor>,
        interval: Duration,
    ) {
        if series.is_cancelled() {
            return;
        }
        let next = Action::Repeating { action, interval };
        if let Err(e) = self.enqueue(series, next, executor, interval) {
            error!(task = %series.id, "cannot reschedule periodic task: {e}");
        }
    }

    fn arm_backstop(&self, kind: AlarmKind) -> Result<()> {
        let request = AlarmRequest {
            fire_not_before: self.clock.now().saturating_add(self.backstop_interval),
            kind,
            payload: AlarmPayload {
                process_id: self.process_id,
            },
        };
        self.alarm.arm(request)?;
        debug!(fire_not_before = %request.fire_not_before, ?kind, "backstop alarm armed");
        Ok(())
    }

    /// Re-arm after a delivery. Holds the alarm state so a concurrent stop
    /// either happens first, and nothing is armed, or cancels this arm.
    fn rearm_logged(&self, stale: bool) -> bool {
        let current = self.lock_alarm_kind();
        let Some(kind) = *current else {
            debug!("scheduler stopped, not re-arming backstop alarm");
            return false;
        };
        // Repeating alarms re-arm themselves unless armed by someone else.
        if kind.repeats() && !stale {
            return true;
        }
        match self.arm_backstop(kind) {
            Ok(()) => true,
            Err(e) => {
                error!("cannot re-arm backstop alarm: {e}");
                false
            }
        }
    }

    fn handle_alarm(self: &Arc<Self>, payload: AlarmPayload) -> AlarmOutcome {
        if payload.process_id != self.process_id {
            info!(
                alarm_pid = %payload.process_id,
                current_pid = %self.process_id,
                "ignoring alarm armed by another process"
            );
            // Re-register under this process's identity; the facility
            // replaces the stale registration.
            let rearmed = self.rearm_logged(true);
            return AlarmOutcome::Stale { rearmed };
        }

        info!("backstop alarm");
        let rearmed = self.rearm_logged(false);
        AlarmOutcome::Handled {
            rearmed,
            report: self.sweep(),
        }
    }
}

fn run_isolated(task: TaskId, action: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        error!(%task, "scheduled task failed: {message}");
    }
}

/// Schedules tasks against a boot-relative clock, waking the host to run
/// them.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler fenced by the current process's identity.
    pub fn new(facilities: Facilities, config: &SchedulerConfig) -> Self {
        Self::with_process_id(facilities, config, ProcessId::current())
    }

    /// Create a scheduler fenced by an explicit process identity.
    pub fn with_process_id(
        facilities: Facilities,
        config: &SchedulerConfig,
        process_id: ProcessId,
    ) -> Self {
        let Facilities {
            clock,
            timer,
            alarm,
            wake_locks,
        } = facilities;
        Self {
            inner: Arc::new(Inner {
                clock,
                timer,
                alarm,
                wake_locks,
                process_id,
                backstop_interval: config.backstop_interval(),
                prefer_exact_alarm: config.prefer_exact_alarm,
                queue: Mutex::new(TaskQueue::new(config.compaction_threshold)),
                next_task_id: AtomicU64::new(1),
                alarm_kind: Mutex::new(None),
            }),
        }
    }

    /// Identity stamped on every backstop alarm this scheduler arms.
    pub fn process_id(&self) -> ProcessId {
        self.inner.process_id
    }

    /// Number of queued occurrences that are neither due-and-run nor
    /// cancelled.
    pub fn pending_tasks(&self) -> usize {
        self.inner.lock_queue().len()
    }

    /// Run `task` once on `executor`, no earlier than `delay` from now.
    ///
    /// # Errors
    ///
    /// Returns [`WakefulError::InvalidArgument`] if the due time would
    /// overflow the clock.
    pub fn schedule(
        &self,
        task: impl FnOnce() + Send + 'static,
        executor: Arc<dyn Executor>,
        delay: Duration,
    ) -> Result<Cancellable> {
        let series = self.inner.new_series();
        self.inner
            .enqueue(&series, Action::Once(Box::new(task)), executor, delay)?;
        Ok(self.handle(series))
    }

    /// Run `task` on `executor` after `initial_delay`, then again `interval`
    /// after each run finishes, until cancelled.
    ///
    /// A run that panics is logged and the series carries on.
    ///
    /// # Errors
    ///
    /// Returns [`WakefulError::InvalidArgument`] if `interval` is zero or the
    /// first due time would overflow the clock.
    pub fn schedule_with_fixed_delay(
        &self,
        task: impl Fn() + Send + Sync + 'static,
        executor: Arc<dyn Executor>,
        initial_delay: Duration,
        interval: Duration,
    ) -> Result<Cancellable> {
        if interval.is_zero() {
            return Err(WakefulError::InvalidArgument(
                "fixed-delay interval must be positive".to_owned(),
            ));
        }
        let series = self.inner.new_series();
        let action = Action::Repeating {
            action: Arc::new(task),
            interval,
        };
        self.inner
            .enqueue(&series, action, executor, initial_delay)?;
        Ok(self.handle(series))
    }

    fn handle(&self, series: Arc<Series>) -> Cancellable {
        Cancellable {
            series,
            scheduler: Arc::downgrade(&self.inner),
        }
    }

    /// Dispatch every due task while holding a wake lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake lock cannot be acquired. Nothing is
    /// dequeued in that case; the tasks wait for the next check or alarm.
    pub fn run_due_tasks(&self) -> Result<SweepReport> {
        self.inner.run_due_tasks()
    }

    /// Entry point for backstop alarm deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake lock for handling the alarm cannot be
    /// acquired.
    pub fn on_backstop_alarm_fired(&self, payload: AlarmPayload) -> Result<AlarmOutcome> {
        if self.inner.lock_alarm_kind().is_none() {
            debug!(alarm_pid = %payload.process_id, "scheduler stopped, ignoring alarm");
            return Ok(AlarmOutcome::Ignored);
        }
        self.inner
            .wake_locks
            .run_wakefully(|| self.inner.handle_alarm(payload), ALARM_TAG)
    }

    /// Feed alarm deliveries from `rx` into
    /// [`on_backstop_alarm_fired`](Self::on_backstop_alarm_fired) until
    /// `cancel` fires or the sender is dropped.
    pub async fn listen_for_alarms(
        self,
        mut rx: mpsc::UnboundedReceiver<AlarmPayload>,
        cancel: CancellationToken,
    ) {
        info!("alarm listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                payload = rx.recv() => {
                    let Some(payload) = payload else {
                        break;
                    };
                    let scheduler = self.clone();
                    let handled = tokio::task::spawn_blocking(move || {
                        scheduler.on_backstop_alarm_fired(payload)
                    })
                    .await;
                    match handled {
                        Ok(Ok(outcome)) => debug!(?outcome, "alarm handled"),
                        Ok(Err(e)) => warn!("cannot handle alarm: {e}"),
                        Err(e) => error!("alarm handler failed: {e}"),
                    }
                }
            }
        }
        info!("alarm listener stopped");
    }
}

impl Service for Scheduler {
    fn start_service(&self) -> Result<()> {
        let inner = &self.inner;
        let kind = if inner.prefer_exact_alarm && inner.alarm.supports_exact_while_idle() {
            AlarmKind::ExactWhileIdle
        } else {
            AlarmKind::InexactRepeating {
                interval: inner.backstop_interval,
            }
        };
        let mut current = inner.lock_alarm_kind();
        inner.arm_backstop(kind)?;
        *current = Some(kind);
        drop(current);
        info!(pid = %inner.process_id, ?kind, "task scheduler started");
        Ok(())
    }

    fn stop_service(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut current = inner.lock_alarm_kind();
            *current = None;
            inner.alarm.cancel();
        }
        info!(
            abandoned = inner.lock_queue().len(),
            "task scheduler stopped"
        );
        Ok(())
    }
}
