use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{LullError, Result};
use crate::scheduler::{Scheduler, TimerHandle, TimerTask};

const THREAD_NAME: &str = "lull-timer";

enum TimerCommand {
    Schedule {
        id: u64,
        deadline: Instant,
        task: TimerTask,
    },
    Cancel {
        id: u64,
    },
    Shutdown,
}

/// Wall-clock scheduler running every callback on one timer thread.
pub struct ThreadScheduler {
    epoch: Instant,
    next_id: AtomicU64,
    commands: mpsc::Sender<TimerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    pub fn new() -> Result<Self> {
        let (commands, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run_timer_loop(rx))
            .map_err(|err| LullError::SchedulerFailure(format!("spawn timer thread: {err}")))?;
        Ok(Self {
            epoch: Instant::now(),
            next_id: AtomicU64::new(0),
            commands,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop the timer thread and wait for it. Pending timers are dropped.
    /// Calling this from a timer callback only signals the thread.
    pub fn shutdown(&self) {
        let _ = self.commands.send(TimerCommand::Shutdown);
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = worker.join();
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> Result<TimerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        self.commands
            .send(TimerCommand::Schedule { id, deadline, task })
            .map_err(|_| LullError::SchedulerFailure("timer thread has stopped".to_string()))?;
        Ok(TimerHandle::from_raw(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        let _ = self.commands.send(TimerCommand::Cancel { id: handle.id() });
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer_loop(rx: mpsc::Receiver<TimerCommand>) {
    let mut queue: BTreeMap<(Instant, u64), TimerTask> = BTreeMap::new();
    let mut deadlines: HashMap<u64, Instant> = HashMap::new();

    loop {
        let now = Instant::now();
        while let Some(key) = queue.keys().next().copied() {
            if key.0 > now {
                break;
            }
            deadlines.remove(&key.1);
            if let Some(task) = queue.remove(&key) {
                trace!(timer = key.1, "timer fired");
                task();
            }
        }

        let msg = match queue.keys().next() {
            Some((deadline, _)) => {
                rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(TimerCommand::Schedule { id, deadline, task }) => {
                deadlines.insert(id, deadline);
                queue.insert((deadline, id), task);
            }
            Ok(TimerCommand::Cancel { id }) => {
                if let Some(deadline) = deadlines.remove(&id) {
                    queue.remove(&(deadline, id));
                }
            }
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                debug!(dropped = queue.len(), "timer thread stopping");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
