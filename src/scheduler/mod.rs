//! Wake-aware task scheduler.
//!
//! Tasks are queued by due time on a boot-relative clock. A local timer
//! check and a backstop alarm both lead to the same sweep, which hands due
//! tasks to their executors while holding wake locks.

pub mod engine;
pub mod queue;

pub use engine::{AlarmOutcome, Cancellable, Facilities, Scheduler, SweepReport, TaskId};
pub use queue::{EntryId, TaskQueue};
