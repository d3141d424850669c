//! `systemd-inhibit` backed wake lock.
//!
//! Holding the lock means keeping a `systemd-inhibit ... sleep <secs>` child
//! alive. When the timeout elapses the inner `sleep` exits and logind drops
//! the inhibitor on its own, which gives the OS-side expiry the coordinator
//! relies on if this process stops renewing.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::OsWakeLock;
use crate::error::{Result, WakefulError};

/// How long a fresh inhibitor must stay alive before it counts as held.
/// logind answers a refused inhibit within a D-Bus round trip, after which
/// `systemd-inhibit` exits.
const DEFAULT_SETTLE: Duration = Duration::from_millis(100);
const SETTLE_POLL: Duration = Duration::from_millis(10);

/// Sleep inhibitor held through logind.
#[derive(Debug)]
pub struct SystemdInhibitLock {
    program: PathBuf,
    tag: String,
    settle: Duration,
    child: Mutex<Option<Child>>,
}

impl SystemdInhibitLock {
    /// Use the `systemd-inhibit` binary found on `PATH`, if any.
    pub fn discover(tag: &str) -> Option<Self> {
        let program = which::which("systemd-inhibit").ok()?;
        Some(Self::with_program(program, tag))
    }

    /// Use an explicit inhibitor binary.
    pub fn with_program(program: PathBuf, tag: &str) -> Self {
        Self {
            program,
            tag: tag.to_owned(),
            settle: DEFAULT_SETTLE,
            child: Mutex::new(None),
        }
    }

    /// Override how long a fresh inhibitor is watched for an early exit.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Fail if `child` exits before the settle period is over.
    fn confirm_alive(&self, mut child: Child) -> Result<Child> {
        let deadline = Instant::now() + self.settle;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(WakefulError::WakeLock(format!(
                        "{} exited immediately ({status}); inhibitor refused",
                        self.program.display()
                    )));
                }
                Ok(None) if Instant::now() >= deadline => return Ok(child),
                Ok(None) => std::thread::sleep(SETTLE_POLL),
                Err(e) => {
                    reap(child);
                    return Err(WakefulError::WakeLock(format!(
                        "cannot check inhibitor state: {e}"
                    )));
                }
            }
        }
    }

    fn spawn(&self, timeout: Duration) -> std::io::Result<Child> {
        // `sleep` takes whole seconds; round up so the lock never lapses early.
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        Command::new(&self.program)
            .arg("--what=sleep:idle")
            .arg(format!("--who={}", self.tag))
            .arg("--why=running scheduled work")
            .arg("--mode=block")
            .arg("sleep")
            .arg(secs.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
}

fn reap(mut child: Child) {
    if let Err(e) = child.kill() {
        // Already exited once its timeout elapsed.
        debug!("inhibitor child already gone: {e}");
    }
    if let Err(e) = child.wait() {
        warn!("cannot reap inhibitor child: {e}");
    }
}

impl OsWakeLock for SystemdInhibitLock {
    fn acquire(&self, timeout: Duration) -> Result<()> {
        // Start the new inhibitor before dropping the old one so there is no
        // window in which neither is held.
        let fresh = self.spawn(timeout).map_err(|e| {
            WakefulError::WakeLock(format!(
                "cannot start {}: {e}",
                self.program.display()
            ))
        })?;
        // A refused inhibitor leaves the previous one, if any, in place.
        let fresh = self.confirm_alive(fresh)?;
        let previous = {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            child.replace(fresh)
        };
        if let Some(previous) = previous {
            reap(previous);
        }
        Ok(())
    }

    fn release(&self) {
        let current = {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            child.take()
        };
        if let Some(current) = current {
            reap(current);
        }
    }
}

impl Drop for SystemdInhibitLock {
    fn drop(&mut self) {
        self.release();
    }
}
