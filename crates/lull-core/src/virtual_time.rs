use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::error::{LullError, Result};
use crate::scheduler::{Scheduler, TimerHandle, TimerTask};

#[derive(Default)]
struct Clock {
    now: Duration,
    next_id: u64,
    queue: BTreeMap<(Duration, u64), TimerTask>,
    due: HashMap<u64, Duration>,
}

/// Deterministic scheduler. Due timers run on the thread advancing the
/// clock, ordered by due time then scheduling order, and `now` reads each
/// timer's due time while it runs.
#[derive(Default)]
pub struct VirtualScheduler {
    clock: Mutex<Clock>,
    capacity: Option<usize>,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to hold more than `capacity` outstanding timers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            clock: Mutex::default(),
            capacity: Some(capacity),
        }
    }

    /// Number of timers scheduled and not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn advance_by(&self, delta: Duration) {
        let target = self.lock().now + delta;
        self.advance_to(target);
    }

    /// Run every timer due at or before `target`, then set the clock to
    /// `target`. Moving backwards is a no-op.
    pub fn advance_to(&self, target: Duration) {
        while let Some(task) = self.pop_due(target) {
            task();
        }
        let mut clock = self.lock();
        if clock.now < target {
            clock.now = target;
        }
    }

    /// Fire timers until none remain, including ones scheduled by the
    /// timers themselves.
    pub fn run_until_idle(&self) {
        loop {
            let next = self.lock().queue.keys().next().map(|(due, _)| *due);
            match next {
                Some(due) => self.advance_to(due),
                None => break,
            }
        }
    }

    fn pop_due(&self, target: Duration) -> Option<TimerTask> {
        let mut clock = self.lock();
        let key = *clock.queue.keys().next()?;
        if key.0 > target {
            return None;
        }
        let task = clock.queue.remove(&key)?;
        clock.due.remove(&key.1);
        clock.now = clock.now.max(key.0);
        trace!(timer = key.1, at_ms = key.0.as_millis() as u64, "virtual timer fired");
        Some(task)
    }

    fn lock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> Result<TimerHandle> {
        let mut clock = self.lock();
        if let Some(capacity) = self.capacity {
            if clock.queue.len() >= capacity {
                return Err(LullError::SchedulerFailure(format!(
                    "virtual scheduler is full ({capacity} timers outstanding)"
                )));
            }
        }
        let id = clock.next_id;
        clock.next_id += 1;
        let due = clock.now + delay;
        clock.queue.insert((due, id), task);
        clock.due.insert(id, due);
        Ok(TimerHandle::from_raw(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut clock = self.lock();
        if let Some(due) = clock.due.remove(&handle.id()) {
            clock.queue.remove(&(due, handle.id()));
        }
    }

    fn now(&self) -> Duration {
        self.lock().now
    }
}
