//! Error types for the wakeful scheduler.

/// Top-level error type for scheduling and wake coordination.
#[derive(Debug, thiserror::Error)]
pub enum WakefulError {
    /// A caller passed an argument the scheduler cannot honour.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying OS sleep-inhibiting lock could not be acquired.
    #[error("wake lock error: {0}")]
    WakeLock(String),

    /// An executor refused a submitted job.
    #[error("executor error: {0}")]
    Executor(String),

    /// The backstop alarm facility rejected a request.
    #[error("alarm error: {0}")]
    Alarm(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, WakefulError>;
