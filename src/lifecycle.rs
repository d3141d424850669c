//! Start/stop lifecycle for long-lived components.

use crate::error::Result;

/// A component with explicit start and stop steps.
pub trait Service: Send + Sync {
    /// Begin operating. Calling it on a started service re-runs the start
    /// step.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource the service depends on is unavailable.
    fn start_service(&self) -> Result<()>;

    /// Stop operating. Work already handed off is not interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown could not complete cleanly.
    fn stop_service(&self) -> Result<()>;
}
