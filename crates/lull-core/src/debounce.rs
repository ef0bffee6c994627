use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{LullError, Result};
use crate::exclusive::{Entered, Exclusive};
use crate::observer::Observer;
use crate::scheduler::{Scheduler, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    interval: Duration,
}

impl DebounceConfig {
    pub fn new(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(LullError::InvalidConfiguration(
                "debounce interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self { interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

struct DebounceState<T> {
    pending: Option<T>,
    timer: Option<TimerHandle>,
    generation: u64,
}

struct DebounceInner<T> {
    config: DebounceConfig,
    scheduler: Arc<dyn Scheduler>,
    downstream: Arc<dyn Observer<T>>,
    cell: Exclusive<DebounceState<T>>,
}

/// Emits the most recent value once the input has been quiet for a full
/// interval. Completion flushes a pending value first. Clones share one
/// operator instance.
pub struct Debounce<T> {
    inner: Arc<DebounceInner<T>>,
}

impl<T> Clone for Debounce<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Debounce<T> {
    pub fn new<O>(config: DebounceConfig, scheduler: Arc<dyn Scheduler>, downstream: O) -> Self
    where
        O: Observer<T> + 'static,
    {
        Self::with_downstream(config, scheduler, Arc::new(downstream))
    }

    pub fn with_downstream(
        config: DebounceConfig,
        scheduler: Arc<dyn Scheduler>,
        downstream: Arc<dyn Observer<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                config,
                scheduler,
                downstream,
                cell: Exclusive::new(DebounceState {
                    pending: None,
                    timer: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> DebounceConfig {
        self.inner.config
    }

    /// Store `value` as pending and restart the quiet-period timer.
    ///
    /// If the scheduler refuses the new timer the error is returned and the
    /// previously pending value keeps its original timer.
    pub fn on_value(&self, value: T) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.cell.enter()?;
        if !inner.cell.is_active() {
            trace!("debounce terminated; value ignored");
            return Ok(());
        }

        let generation = state.generation + 1;
        let weak: Weak<DebounceInner<T>> = Arc::downgrade(inner);
        let handle = inner.scheduler.schedule_after(
            inner.config.interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(generation);
                }
            }),
        )?;
        if let Some(previous) = state.timer.replace(handle) {
            inner.scheduler.cancel(previous);
        }
        if state.pending.replace(value).is_some() {
            trace!(generation, "pending value superseded");
        }
        state.generation = generation;
        Ok(())
    }

    /// Flush the pending value, if any, then signal completion.
    pub fn on_complete(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.cell.enter()?;
        if !inner.cell.is_active() {
            return Ok(());
        }
        if let Some(timer) = state.timer.take() {
            inner.scheduler.cancel(timer);
        }
        if let Some(value) = state.pending.take() {
            debug!("flushing pending value on completion");
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
            debug!("debounce cancelled");
        }
    }

    /// Whether the operator was cancelled or has completed.
    pub fn is_terminated(&self) -> bool {
        !self.inner.cell.is_active()
    }

    pub fn has_pending(&self) -> bool {
        self.inner
            .cell
            .enter()
            .map(|state| state.pending.is_some())
            .unwrap_or(false)
    }
}

impl<T: Send + 'static> DebounceInner<T> {
    fn fire(&self, generation: u64) {
        let Ok(mut state) = self.cell.enter() else {
            return;
        };
        if !self.cell.is_active() || state.generation != generation || state.timer.is_none() {
            trace!(generation, "stale debounce timer ignored");
            return;
        }
        state.timer = None;
        if let Some(value) = state.pending.take() {
            debug!(
                generation,
                interval_ms = self.config.interval.as_millis() as u64,
                "quiet period elapsed"
            );
            self.emit(value);
        }
    }

    fn emit(&self, value: T) {
        if let Err(err) = self.downstream.on_value(value) {
            warn!("downstream rejected debounced value: {err}");
        }
    }

    fn release(&self, state: &mut Entered<'_, DebounceState<T>>) {
        if let Some(timer) = state.timer.take() {
            self.scheduler.cancel(timer);
        }
        state.pending = None;
    }
}

impl<T: Send + 'static> Observer<T> for Debounce<T> {
    fn on_value(&self, value: T) -> Result<()> {
        Debounce::on_value(self, value)
    }

    fn on_complete(&self) {
        if let Err(err) = Debounce::on_complete(self) {
            warn!("debounce completion failed: {err}");
        }
    }
}
