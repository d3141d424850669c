//! Backstop alarm facility.
//!
//! A backstop alarm is a coarse wake-up that keeps working when the local
//! timer does not: while the process is suspended, or after the OS has
//! killed the timer thread. Real facilities are OS services that can outlive
//! the process that armed them, so every registration carries the arming
//! process's identity and deliveries from a previous incarnation can be
//! fenced off.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::{Clock, Timestamp};
use crate::error::Result;

/// Identifier of one process incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Identity of the running process.
    #[must_use]
    pub fn current() -> Self {
        Self(std::process::id())
    }

    /// Wrap a raw process identifier.
    #[must_use]
    pub const fn from_raw(pid: u32) -> Self {
        Self(pid)
    }

    /// The raw process identifier.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data attached to an alarm registration and handed back on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmPayload {
    /// Process that armed the alarm.
    pub process_id: ProcessId,
}

/// Which flavour of alarm to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    /// One-shot alarm allowed to fire while the device is idle. Must be
    /// re-armed after each delivery.
    ExactWhileIdle,
    /// Repeating alarm the OS may batch; re-arms itself.
    InexactRepeating {
        /// Nominal spacing between deliveries.
        interval: Duration,
    },
}

impl AlarmKind {
    /// Returns `true` if the facility re-arms this kind by itself.
    #[must_use]
    pub fn repeats(self) -> bool {
        matches!(self, Self::InexactRepeating { .. })
    }
}

/// A single alarm registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmRequest {
    /// Earliest boot-relative time at which the alarm may fire.
    pub fire_not_before: Timestamp,
    /// Alarm flavour.
    pub kind: AlarmKind,
    /// Handed back on delivery.
    pub payload: AlarmPayload,
}

/// An OS-level wake-up facility.
///
/// Arming replaces any registration previously made through the same
/// facility, so at most one alarm is outstanding at a time.
pub trait BackstopAlarm: Send + Sync {
    /// Whether [`AlarmKind::ExactWhileIdle`] is available on this host.
    fn supports_exact_while_idle(&self) -> bool;

    /// Register `request`, replacing any previous registration.
    ///
    /// # Errors
    ///
    /// Returns [`WakefulError::Alarm`](crate::error::WakefulError::Alarm) if
    /// the facility rejects the request.
    fn arm(&self, request: AlarmRequest) -> Result<()>;

    /// Remove the outstanding registration, if any.
    fn cancel(&self);
}

/// Facility for hosts without any backstop; arming is accepted and ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackstopAlarm;

impl BackstopAlarm for NoopBackstopAlarm {
    fn supports_exact_while_idle(&self) -> bool {
        false
    }

    fn arm(&self, request: AlarmRequest) -> Result<()> {
        debug!(
            fire_not_before = %request.fire_not_before,
            "no backstop alarm facility, ignoring registration"
        );
        Ok(())
    }

    fn cancel(&self) {}
}

/// In-process alarm facility on a tokio runtime.
///
/// Deliveries are sent as [`AlarmPayload`]s over an unbounded channel; the
/// receiver is typically drained by
/// [`Scheduler::listen_for_alarms`](crate::scheduler::Scheduler::listen_for_alarms).
/// Because it lives inside the process it cannot survive a restart; it
/// exists for hosts that have no OS alarm service and for end-to-end tests
/// of the delivery path.
pub struct TokioBackstopAlarm {
    handle: tokio::runtime::Handle,
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<AlarmPayload>,
    current: Mutex<Option<CancellationToken>>,
}

impl TokioBackstopAlarm {
    /// Create the facility and the receiving end of its delivery channel.
    pub fn new(
        handle: tokio::runtime::Handle,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<AlarmPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let alarm = Self {
            handle,
            clock,
            tx,
            current: Mutex::new(None),
        };
        (alarm, rx)
    }

    fn replace_registration(&self, token: Option<CancellationToken>) {
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, token)
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

impl BackstopAlarm for TokioBackstopAlarm {
    fn supports_exact_while_idle(&self) -> bool {
        true
    }

    fn arm(&self, request: AlarmRequest) -> Result<()> {
        let token = CancellationToken::new();
        self.replace_registration(Some(token.clone()));

        let first = request
            .fire_not_before
            .saturating_duration_since(self.clock.now());
        let tx = self.tx.clone();
        let payload = request.payload;
        let kind = request.kind;
        self.handle.spawn(async move {
            let mut wait = first;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        if tx.send(payload).is_err() {
                            debug!("alarm receiver dropped, stopping alarm");
                            break;
                        }
                        match kind {
                            AlarmKind::ExactWhileIdle => break,
                            AlarmKind::InexactRepeating { interval } => wait = interval,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn cancel(&self) {
        self.replace_registration(None);
    }
}
