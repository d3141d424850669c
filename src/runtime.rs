//! Composition root wiring the scheduler to real platform facilities.
//!
//! ```rust,ignore
//! let runtime = WakefulRuntime::start(&config, tokio::runtime::Handle::current())?;
//! let executor = runtime.executor();
//! runtime.scheduler().schedule(|| sync_now(), executor, Duration::from_secs(30))?;
//! // ...
//! runtime.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alarm::TokioBackstopAlarm;
use crate::clock::{Clock, SystemClock};
use crate::config::WakefulConfig;
use crate::error::Result;
use crate::executor::{Executor, TokioExecutor};
use crate::lifecycle::Service;
use crate::platform::{OsWakeLock, create_os_wake_lock};
use crate::scheduler::{Facilities, Scheduler};
use crate::timer::{LocalTimer, TokioTimer};
use crate::wake_lock::WakeLockManager;

/// A started scheduler together with the tasks that feed it.
pub struct WakefulRuntime {
    scheduler: Scheduler,
    wake_locks: WakeLockManager,
    executor: Arc<TokioExecutor>,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
}

impl WakefulRuntime {
    /// Build and start a runtime on `handle` using the platform OS wake lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the backstop alarm
    /// cannot be armed.
    pub fn start(config: &WakefulConfig, handle: tokio::runtime::Handle) -> Result<Self> {
        let os_lock = create_os_wake_lock(&config.wake_lock.tag);
        Self::start_with_os_lock(config, handle, os_lock)
    }

    /// Build and start a runtime on `handle` with an explicit OS wake lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the backstop alarm
    /// cannot be armed.
    pub fn start_with_os_lock(
        config: &WakefulConfig,
        handle: tokio::runtime::Handle,
        os_lock: Box<dyn OsWakeLock>,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let timer: Arc<dyn LocalTimer> =
            Arc::new(TokioTimer::new(handle.clone(), cancel.child_token()));
        let wake_locks = WakeLockManager::new(
            os_lock,
            Arc::clone(&timer),
            Arc::clone(&clock),
            &config.wake_lock,
        );
        let (alarm, alarm_rx) = TokioBackstopAlarm::new(handle.clone(), Arc::clone(&clock));

        let scheduler = Scheduler::new(
            Facilities {
                clock,
                timer,
                alarm: Arc::new(alarm),
                wake_locks: wake_locks.clone(),
            },
            &config.scheduler,
        );
        scheduler.start_service()?;

        let listener = handle.spawn(
            scheduler
                .clone()
                .listen_for_alarms(alarm_rx, cancel.child_token()),
        );

        info!(pid = %scheduler.process_id(), "wakeful runtime started");
        Ok(Self {
            scheduler,
            wake_locks,
            executor: Arc::new(TokioExecutor::new(handle)),
            cancel,
            listener,
        })
    }

    /// The running scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The wake lock coordinator shared with the scheduler.
    pub fn wake_locks(&self) -> &WakeLockManager {
        &self.wake_locks
    }

    /// Executor running jobs on the runtime's blocking pool.
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor) as Arc<dyn Executor>
    }

    /// Stop the scheduler, abandon pending timers and wait for the alarm
    /// listener to exit.
    pub async fn shutdown(self) {
        if let Err(e) = self.scheduler.stop_service() {
            warn!("scheduler did not stop cleanly: {e}");
        }
        self.cancel.cancel();
        if let Err(e) = self.listener.await {
            warn!("alarm listener failed: {e}");
        }
        info!("wakeful runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::platform::StubWakeLock;
    use std::time::Duration;

    fn stub_lock() -> Box<dyn OsWakeLock> {
        Box::new(StubWakeLock::new("test"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scheduled_task_runs_through_local_timer() {
        let runtime = WakefulRuntime::start_with_os_lock(
            &WakefulConfig::default(),
            tokio::runtime::Handle::current(),
            stub_lock(),
        )
        .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        runtime
            .scheduler()
            .schedule(
                move || {
                    let _ = tx.send(());
                },
                runtime.executor(),
                Duration::from_millis(20),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("task should run")
            .unwrap();
        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn survives_backstop_deliveries() {
        let mut config = WakefulConfig::default();
        config.scheduler.backstop_interval_secs = 1;
        let runtime = WakefulRuntime::start_with_os_lock(
            &config,
            tokio::runtime::Handle::current(),
            stub_lock(),
        )
        .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        runtime
            .scheduler()
            .schedule(
                move || {
                    let _ = tx.send(());
                },
                runtime.executor(),
                Duration::ZERO,
            )
            .unwrap();
        rx.await.unwrap();

        // First delivery lands after one second; its sweep releases the lock.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!runtime.wake_locks().is_held());
        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_config_is_rejected() {
        let mut config = WakefulConfig::default();
        config.wake_lock.lock_duration_secs = 0;
        let result = WakefulRuntime::start_with_os_lock(
            &config,
            tokio::runtime::Handle::current(),
            stub_lock(),
        );
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_cancels_pending_tasks() {
        let runtime = WakefulRuntime::start_with_os_lock(
            &WakefulConfig::default(),
            tokio::runtime::Handle::current(),
            stub_lock(),
        )
        .unwrap();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        runtime
            .scheduler()
            .schedule(
                move || ran_clone.store(true, std::sync::atomic::Ordering::SeqCst),
                runtime.executor(),
                Duration::from_millis(200),
            )
            .unwrap();
        runtime.shutdown().await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_stops_fast_series_on_worker_threads() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let runtime = WakefulRuntime::start_with_os_lock(
            &WakefulConfig::default(),
            tokio::runtime::Handle::current(),
            stub_lock(),
        )
        .unwrap();

        for round in 0..20u64 {
            let started = Arc::new(AtomicUsize::new(0));
            let started_clone = Arc::clone(&started);
            let handle = runtime
                .scheduler()
                .schedule_with_fixed_delay(
                    move || {
                        started_clone.fetch_add(1, Ordering::SeqCst);
                    },
                    runtime.executor(),
                    Duration::ZERO,
                    Duration::from_millis(1),
                )
                .unwrap();
            tokio::time::sleep(Duration::from_millis(round % 5)).await;

            handle.cancel();
            let at_cancel = started.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;

            // An occurrence past its cancellation check when cancel() ran
            // may still start; nothing after it.
            let after = started.load(Ordering::SeqCst);
            assert!(
                after <= at_cancel + 1,
                "round {round}: {after} runs, {at_cancel} at cancel"
            );
        }

        assert_eq!(runtime.scheduler().pending_tasks(), 0);
        runtime.shutdown().await;
    }
}
