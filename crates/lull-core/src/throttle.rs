use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::{LullError, Result};
use crate::exclusive::{Entered, Exclusive};
use crate::observer::Observer;
use crate::scheduler::{Scheduler, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    interval: Duration,
    emit_latest: bool,
}

impl ThrottleConfig {
    pub fn new(interval: Duration, emit_latest: bool) -> Result<Self> {
        if interval.is_zero() {
            return Err(LullError::InvalidConfiguration(
                "throttle interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            interval,
            emit_latest,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn emit_latest(&self) -> bool {
        self.emit_latest
    }
}

struct ThrottleState<T> {
    /// Timer closing the open window; `None` while idle.
    window: Option<TimerHandle>,
    latest: Option<T>,
    generation: u64,
    /// Set when a boundary emission could not re-open its window.
    cooldown_until: Option<Duration>,
}

type Guard<'a, T> = Entered<'a, ThrottleState<T>>;

struct ThrottleInner<T> {
    config: ThrottleConfig,
    scheduler: Arc<dyn Scheduler>,
    downstream: Arc<dyn Observer<T>>,
    cell: Exclusive<ThrottleState<T>>,
}

/// Emits at most one value per window.
///
/// The first value seen while idle goes out immediately and opens a window.
/// Values arriving inside the window are dropped, or, with `emit_latest`,
/// the newest one is kept and emitted when the window closes, which opens
/// the next window at that instant. Windows are half-open: a value arriving
/// exactly at the closing instant is handled after the window has closed.
/// Clones share one operator instance.
pub struct Throttle<T> {
    inner: Arc<ThrottleInner<T>>,
}

impl<T> Clone for Throttle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Throttle<T> {
    pub fn new<O>(config: ThrottleConfig, scheduler: Arc<dyn Scheduler>, downstream: O) -> Self
    where
        O: Observer<T> + 'static,
    {
        Self::with_downstream(config, scheduler, Arc::new(downstream))
    }

    pub fn with_downstream(
        config: ThrottleConfig,
        scheduler: Arc<dyn Scheduler>,
        downstream: Arc<dyn Observer<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                config,
                scheduler,
                downstream,
                cell: Exclusive::new(ThrottleState {
                    window: None,
                    latest: None,
                    generation: 0,
                    cooldown_until: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> ThrottleConfig {
        self.inner.config
    }

    /// Emit `value` now if idle, otherwise drop or buffer it per policy.
    ///
    /// Opening a window needs a timer; if the scheduler refuses it the
    /// value is not emitted and the error is returned.
    pub fn on_value(&self, value: T) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.cell.enter()?;
        if !inner.cell.is_active() {
            trace!("throttle terminated; value ignored");
            return Ok(());
        }

        if state.window.is_some() {
            if inner.config.emit_latest {
                if state.latest.replace(value).is_some() {
                    trace!("buffered value overwritten");
                }
            } else {
                trace!("value dropped inside window");
            }
            return Ok(());
        }

        if let Some(until) = state.cooldown_until.take() {
            let now = inner.scheduler.now();
            if now < until {
                state.cooldown_until = Some(until);
                if inner.config.emit_latest {
                    inner.open_window(&mut state, until - now)?;
                    state.latest = Some(value);
                } else {
                    trace!("value dropped during cool-down");
                }
                return Ok(());
            }
        }

        inner.open_window(&mut state, inner.config.interval)?;
        inner.emit(value);
        if !inner.cell.is_active() {
            inner.release(&mut state);
        }
        Ok(())
    }

    /// Flush a buffered value, if any, then signal completion.
    pub fn on_complete(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.cell.enter()?;
        if !inner.cell.is_active() {
            return Ok(());
        }
        if let Some(window) = state.window.take() {
            inner.scheduler.cancel(window);
        }
        if let Some(value) = state.latest.take() {
            debug!("flushing buffered value on completion");
            inner.emit(value);
        }
        if inner.cell.deactivate() {
            inner.downstream.on_complete();
        }
        Ok(())
    }

    /// Stop the operator. Once this returns no downstream callback is
    /// running or will run. Idempotent; safe to call from the downstream
    /// callback itself.
    pub fn cancel(&self) {
        let inner = &self.inner;
        if !inner.cell.deactivate() {
            return;
        }
        if inner.cell.held_by_current_thread() {
            return;
        }
        if let Ok(mut state) = inner.cell.enter() {
            inner.release(&mut state);
            debug!("throttle cancelled");
        }
    }

    pub fn is_terminated(&self) -> bool {
        !self.inner.cell.is_active()
    }

    /// Whether a window is currently open.
    pub fn window_open(&self) -> bool {
        self.inner
            .cell
            .enter()
            .map(|state| state.window.is_some())
            .unwrap_or(false)
    }
}

impl<T: Send + 'static> ThrottleInner<T> {
    fn open_window(self: &Arc<Self>, state: &mut Guard<'_, T>, length: Duration) -> Result<()> {
        let generation = state.generation + 1;
        let weak: Weak<ThrottleInner<T>> = Arc::downgrade(self);
        let handle = self.scheduler.schedule_after(
            length,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.close_window(generation);
                }
            }),
        )?;
        state.window = Some(handle);
        state.generation = generation;
        state.cooldown_until = None;
        trace!(generation, "window opened");
        Ok(())
    }

    fn close_window(self: &Arc<Self>, generation: u64) {
        let Ok(mut state) = self.cell.enter() else {
            return;
        };
        if !self.cell.is_active() || state.generation != generation || state.window.is_none() {
            trace!(generation, "stale throttle timer ignored");
            return;
        }
        state.window = None;
        let Some(value) = state.latest.take() else {
            trace!(generation, "window closed; throttle idle");
            return;
        };
        if let Err(err) = self.open_window(&mut state, self.config.interval) {
            error!("failed to re-open throttle window: {err}");
            state.cooldown_until = Some(self.scheduler.now() + self.config.interval);
        }
        debug!(
            generation,
            interval_ms = self.config.interval.as_millis() as u64,
            "emitting latest value at window boundary"
        );
        self.emit(value);
        if !self.cell.is_active() {
            self.release(&mut state);
        }
    }

    fn emit(&self, value: T) {
        if let Err(err) = self.downstream.on_value(value) {
            warn!("downstream rejected throttled value: {err}");
        }
    }

    fn release(&self, state: &mut Guard<'_, T>) {
        if let Some(window) = state.window.take() {
            self.scheduler.cancel(window);
        }
        state.latest = None;
    }
}

impl<T: Send + 'static> Observer<T> for Throttle<T> {
    fn on_value(&self, value: T) -> Result<()> {
        Throttle::on_value(self, value)
    }

    fn on_complete(&self) {
        if let Err(err) = Throttle::on_complete(self) {
            warn!("throttle completion failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Throttle, ThrottleConfig};
    use crate::observer::Callbacks;
    use crate::error::Result;
    use crate::scheduler::{Scheduler, TimerHandle, TimerTask};
    use crate::{LullError, VirtualScheduler};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    type Log = Arc<Mutex<Vec<(u64, String)>>>;

    fn harness(interval: u64, emit_latest: bool) -> (Arc<VirtualScheduler>, Throttle<String>, Log) {
        let sched = Arc::new(VirtualScheduler::new());
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (values, completions) = (log.clone(), log.clone());
        let (clock_v, clock_c) = (sched.clone(), sched.clone());
        let observer = Callbacks::new(move |v: String| {
            values
                .lock()
                .unwrap()
                .push((clock_v.now().as_millis() as u64, v))
        })
        .with_complete(move || {
            completions
                .lock()
                .unwrap()
                .push((clock_c.now().as_millis() as u64, "<complete>".to_string()))
        });
        let config = ThrottleConfig::new(ms(interval), emit_latest).unwrap();
        let op = Throttle::new(config, sched.clone(), observer);
        (sched, op, log)
    }

    fn feed(sched: &VirtualScheduler, op: &Throttle<String>, inputs: &[(u64, &str)]) {
        for (at, value) in inputs {
            sched.advance_to(ms(*at));
            op.on_value(value.to_string()).unwrap();
        }
    }

    fn entries(log: &Log) -> Vec<(u64, String)> {
        log.lock().unwrap().clone()
    }

    fn pairs(expected: &[(u64, &str)]) -> Vec<(u64, String)> {
        expected.iter().map(|(t, v)| (*t, v.to_string())).collect()
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ThrottleConfig::new(Duration::ZERO, true).unwrap_err();
        assert!(matches!(err, LullError::InvalidConfiguration(_)));
    }

    #[test]
    fn leading_edge_drops_values_inside_window() {
        let (sched, op, log) = harness(200, false);
        feed(&sched, &op, &[(0, "a"), (50, "b"), (100, "c"), (250, "d")]);
        sched.advance_to(ms(1000));
        assert_eq!(entries(&log), pairs(&[(0, "a"), (250, "d")]));
    }

    #[test]
    fn latest_value_is_emitted_when_window_closes() {
        let (sched, op, log) = harness(200, true);
        feed(&sched, &op, &[(0, "a"), (50, "b"), (150, "c")]);
        sched.advance_to(ms(199));
        assert_eq!(entries(&log), pairs(&[(0, "a")]));
        sched.advance_to(ms(200));
        assert_eq!(entries(&log), pairs(&[(0, "a"), (200, "c")]));
        // The boundary emission re-opened a window that closes idle at 400.
        assert!(op.window_open());
        sched.advance_to(ms(400));
        assert!(!op.window_open());
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn continuous_traffic_emits_once_per_interval() {
        let (sched, op, log) = harness(100, true);
        let inputs: Vec<(u64, String)> = (0..10).map(|i| (i * 30, format!("v{i}"))).collect();
        for (at, value) in &inputs {
            sched.advance_to(ms(*at));
            op.on_value(value.clone()).unwrap();
        }
        sched.run_until_idle();
        assert_eq!(
            entries(&log),
            pairs(&[(0, "v0"), (100, "v3"), (200, "v6"), (300, "v9")])
        );
    }

    #[test]
    fn value_exactly_at_boundary_after_idle_close_is_emitted_immediately() {
        let (sched, op, log) = harness(200, false);
        feed(&sched, &op, &[(0, "a"), (200, "b")]);
        assert_eq!(entries(&log), pairs(&[(0, "a"), (200, "b")]));
    }

    #[test]
    fn value_exactly_at_boundary_after_flush_is_buffered() {
        let (sched, op, log) = harness(200, true);
        feed(&sched, &op, &[(0, "a"), (100, "b"), (200, "c")]);
        assert_eq!(entries(&log), pairs(&[(0, "a"), (200, "b")]));
        sched.advance_to(ms(400));
        assert_eq!(entries(&log), pairs(&[(0, "a"), (200, "b"), (400, "c")]));
    }

    #[test]
    fn completion_flushes_buffered_value() {
        let (sched, op, log) = harness(200, true);
        feed(&sched, &op, &[(0, "a"), (80, "b")]);
        op.on_complete().unwrap();
        op.on_complete().unwrap();
        sched.run_until_idle();
        assert_eq!(
            entries(&log),
            pairs(&[(0, "a"), (80, "b"), (80, "<complete>")])
        );
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn leading_edge_completion_has_nothing_to_flush() {
        let (sched, op, log) = harness(200, false);
        feed(&sched, &op, &[(0, "a"), (80, "b")]);
        op.on_complete().unwrap();
        assert_eq!(entries(&log), pairs(&[(0, "a"), (80, "<complete>")]));
    }

    #[test]
    fn cancel_stops_window_and_buffer() {
        let (sched, op, log) = harness(200, true);
        feed(&sched, &op, &[(0, "a"), (80, "b")]);
        op.cancel();
        op.cancel();
        assert_eq!(sched.pending(), 0);
        sched.run_until_idle();
        op.on_value("c".to_string()).unwrap();
        op.on_complete().unwrap();
        assert_eq!(entries(&log), pairs(&[(0, "a")]));
    }

    #[test]
    fn refused_window_timer_suppresses_emission() {
        let sched = Arc::new(VirtualScheduler::with_capacity(0));
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let op = Throttle::new(
            ThrottleConfig::new(ms(100), false).unwrap(),
            sched.clone(),
            Callbacks::new(move |v: String| sink.lock().unwrap().push((0, v))),
        );
        let err = op.on_value("a".to_string()).unwrap_err();
        assert!(matches!(err, LullError::SchedulerFailure(_)));
        assert!(entries(&log).is_empty());
        assert!(!op.window_open());
    }

    #[test]
    fn cancel_from_downstream_callback_releases_window() {
        let sched = Arc::new(VirtualScheduler::new());
        let slot: Arc<Mutex<Option<Throttle<String>>>> = Arc::new(Mutex::new(None));
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (sink, handle) = (log.clone(), slot.clone());
        let op = Throttle::new(
            ThrottleConfig::new(ms(100), true).unwrap(),
            sched.clone(),
            Callbacks::new(move |v: String| {
                sink.lock().unwrap().push((0, v));
                if let Some(op) = handle.lock().unwrap().as_ref() {
                    op.cancel();
                }
            }),
        );
        *slot.lock().unwrap() = Some(op.clone());
        op.on_value("a".to_string()).unwrap();
        assert!(op.is_terminated());
        assert_eq!(sched.pending(), 0);
        op.on_value("b".to_string()).unwrap();
        assert_eq!(entries(&log), pairs(&[(0, "a")]));
        slot.lock().unwrap().take();
    }

    #[test]
    fn calls_from_own_callback_are_refused_not_deadlocked() {
        let sched = Arc::new(VirtualScheduler::new());
        let slot: Arc<Mutex<Option<Throttle<String>>>> = Arc::new(Mutex::new(None));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (handle, sink) = (slot.clone(), errors.clone());
        let op = Throttle::new(
            ThrottleConfig::new(ms(100), true).unwrap(),
            sched.clone(),
            Callbacks::new(move |_: String| {
                if let Some(op) = handle.lock().unwrap().as_ref() {
                    let mut errors = sink.lock().unwrap();
                    errors.push(op.on_value("again".to_string()).unwrap_err());
                    errors.push(op.on_complete().unwrap_err());
                }
            }),
        );
        *slot.lock().unwrap() = Some(op.clone());
        op.on_value("a".to_string()).unwrap();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, LullError::ReentrantCall)));
        assert!(!op.is_terminated());
        assert!(op.window_open());
        slot.lock().unwrap().take();
    }

    /// Virtual scheduler that can be told to refuse new timers.
    struct Refusing {
        clock: Arc<VirtualScheduler>,
        refuse: AtomicBool,
    }

    impl Scheduler for Refusing {
        fn schedule_after(&self, delay: Duration, task: TimerTask) -> Result<TimerHandle> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(LullError::SchedulerFailure("refused".to_string()));
            }
            self.clock.schedule_after(delay, task)
        }

        fn cancel(&self, handle: TimerHandle) {
            self.clock.cancel(handle);
        }

        fn now(&self) -> Duration {
            self.clock.now()
        }
    }

    #[test]
    fn failed_window_reopen_still_caps_the_rate() {
        let clock = Arc::new(VirtualScheduler::new());
        let sched = Arc::new(Refusing {
            clock: clock.clone(),
            refuse: AtomicBool::new(false),
        });
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (sink, stamp) = (log.clone(), clock.clone());
        let op = Throttle::new(
            ThrottleConfig::new(ms(100), true).unwrap(),
            sched.clone(),
            Callbacks::new(move |v: String| {
                sink.lock()
                    .unwrap()
                    .push((stamp.now().as_millis() as u64, v))
            }),
        );

        feed(&clock, &op, &[(0, "a"), (50, "b")]);
        sched.refuse.store(true, Ordering::SeqCst);
        clock.advance_to(ms(100));
        assert_eq!(entries(&log), pairs(&[(0, "a"), (100, "b")]));
        assert!(!op.window_open());

        sched.refuse.store(false, Ordering::SeqCst);
        feed(&clock, &op, &[(150, "c")]);
        assert_eq!(entries(&log), pairs(&[(0, "a"), (100, "b")]));
        clock.run_until_idle();
        assert_eq!(
            entries(&log),
            pairs(&[(0, "a"), (100, "b"), (200, "c")])
        );
    }
}
