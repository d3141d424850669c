//! Executors that run dispatched jobs.
//!
//! The scheduler never runs task actions on its own threads; every due task
//! is handed to the [`Executor`] supplied at scheduling time. Submission may
//! fail (a shut-down pool, thread exhaustion), and that failure is reported
//! back to the dispatcher so it can release any wake lock it took.

use crate::error::{Result, WakefulError};

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs, possibly on another thread.
pub trait Executor: Send + Sync {
    /// Submit `job` for execution.
    ///
    /// # Errors
    ///
    /// Returns [`WakefulError::Executor`] if the job was not accepted. A
    /// rejected job is dropped without running.
    fn execute(&self, job: Job) -> Result<()>;
}

/// Runs each job synchronously on the submitting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }
}

/// Spawns a fresh, named OS thread per job.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    name: String,
}

impl ThreadExecutor {
    /// Create an executor whose threads carry `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("wakeful-worker")
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(job)
            .map(|_| ())
            .map_err(|e| WakefulError::Executor(format!("cannot spawn {}: {e}", self.name)))
    }
}

/// Runs jobs on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    /// Bind to an explicit runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime the caller is currently inside.
    ///
    /// # Errors
    ///
    /// Returns [`WakefulError::Executor`] when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| WakefulError::Executor(format!("no tokio runtime: {e}")))
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn inline_executor_runs_before_returning() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        InlineExecutor
            .execute(Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_executor_runs_on_named_thread() {
        let (tx, rx) = mpsc::channel();
        ThreadExecutor::new("wakeful-test")
            .execute(Box::new(move || {
                let name = std::thread::current().name().map(str::to_owned);
                tx.send(name).unwrap();
            }))
            .unwrap();
        let name = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("job should run");
        assert_eq!(name.as_deref(), Some("wakeful-test"));
    }

    #[tokio::test]
    async fn tokio_executor_runs_on_blocking_pool() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let executor = TokioExecutor::current().unwrap();
        executor
            .execute(Box::new(move || {
                let _ = tx.send(7);
            }))
            .unwrap();
        let value = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .expect("job should run")
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn tokio_executor_requires_runtime() {
        assert!(TokioExecutor::current().is_err());
    }
}
