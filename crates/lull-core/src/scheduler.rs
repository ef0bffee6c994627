use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Deferred work registered with a [`Scheduler`].
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Opaque token for a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Wrap a scheduler-specific timer id.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Timer capability handed to the operators, so the same operator runs on
/// wall-clock time or on a manually advanced clock.
pub trait Scheduler: Send + Sync {
    /// Register `task` to run once after `delay`.
    ///
    /// The task must never run on the calling thread before this returns.
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> Result<TimerHandle>;

    /// Drop a scheduled task. Unknown or already fired handles are ignored.
    fn cancel(&self, handle: TimerHandle);

    /// Time elapsed since the scheduler's epoch.
    fn now(&self) -> Duration;
}
