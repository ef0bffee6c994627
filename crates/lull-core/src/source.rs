use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, trace};

use crate::debounce::{Debounce, DebounceConfig};
use crate::error::{LullError, Result};
use crate::observer::Observer;
use crate::scheduler::Scheduler;
use crate::subscription::Subscription;
use crate::throttle::{Throttle, ThrottleConfig};

struct Handler<T> {
    id: u64,
    observer: Arc<dyn Observer<T>>,
}

struct SourceState<T> {
    handlers: Vec<Handler<T>>,
    next_id: u64,
    completed: bool,
    completed_by: Option<ThreadId>,
    /// One entry per `push` currently delivering, by thread.
    delivering: Vec<ThreadId>,
}

struct SourceInner<T> {
    state: Mutex<SourceState<T>>,
    idle: Condvar,
}

/// Push-based stream source.
///
/// `push` delivers synchronously, in registration order, on the calling
/// thread, without the source lock held. `complete` waits for deliveries
/// already in progress on other threads, so no observer sees a value after
/// its completion signal.
pub struct Source<T> {
    inner: Arc<SourceInner<T>>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Source<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(SourceInner {
                state: Mutex::new(SourceState {
                    handlers: Vec::new(),
                    next_id: 0,
                    completed: false,
                    completed_by: None,
                    delivering: Vec::new(),
                }),
                idle: Condvar::new(),
            }),
        }
    }
}

/// Marks one in-flight delivery; dropping it wakes a waiting `complete`.
struct Delivery<'a, T> {
    inner: &'a SourceInner<T>,
    thread: ThreadId,
}

impl<T> Delivery<'_, T> {
    /// Completion was signalled from inside one of this delivery's
    /// callbacks; the remaining observers must not see the value.
    fn completed_here(&self) -> bool {
        lock(&self.inner.state).completed_by == Some(self.thread)
    }
}

impl<T> Drop for Delivery<'_, T> {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        if let Some(pos) = state.delivering.iter().position(|id| *id == self.thread) {
            state.delivering.swap_remove(pos);
        }
        drop(state);
        self.inner.idle.notify_all();
    }
}

impl<T: Clone + Send + 'static> Source<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `value` to every observer. Each observer is tried even if an
    /// earlier one fails; the first error is returned. After `complete`
    /// this fails with [`LullError::StreamClosed`] and drops the value.
    pub fn push(&self, value: T) -> Result<()> {
        let thread = thread::current().id();
        let observers: Vec<Arc<dyn Observer<T>>> = {
            let mut state = lock(&self.inner.state);
            if state.completed {
                return Err(LullError::StreamClosed);
            }
            state.delivering.push(thread);
            state.handlers.iter().map(|h| h.observer.clone()).collect()
        };
        let delivery = Delivery {
            inner: &self.inner,
            thread,
        };
        let Some((last, rest)) = observers.split_last() else {
            trace!("no subscribers; value dropped");
            return Ok(());
        };

        let mut first_err = None;
        for observer in rest {
            if delivery.completed_here() {
                break;
            }
            if let Err(err) = observer.on_value(value.clone()) {
                first_err.get_or_insert(err);
            }
        }
        if !delivery.completed_here() {
            if let Err(err) = last.on_value(value) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Mark the source terminal and signal completion to every observer.
    /// Idempotent. Blocks until pushes running on other threads finish.
    pub fn complete(&self) {
        let thread = thread::current().id();
        let handlers = {
            let mut state = lock(&self.inner.state);
            if state.completed {
                return;
            }
            state.completed = true;
            state.completed_by = Some(thread);
            let handlers = std::mem::take(&mut state.handlers);
            let _state = self
                .inner
                .idle
                .wait_while(state, |s| s.delivering.iter().any(|id| *id != thread))
                .unwrap_or_else(PoisonError::into_inner);
            handlers
        };
        debug!(observers = handlers.len(), "source completed");
        for handler in handlers {
            handler.observer.on_complete();
        }
    }

    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        self.subscribe_arc(Arc::new(observer))
    }

    /// Register `observer`. On a completed source the observer is completed
    /// right away and the returned subscription is already cancelled.
    pub fn subscribe_arc(&self, observer: Arc<dyn Observer<T>>) -> Subscription {
        let id = {
            let mut state = lock(&self.inner.state);
            if state.completed {
                None
            } else {
                let id = state.next_id;
                state.next_id += 1;
                state.handlers.push(Handler {
                    id,
                    observer: observer.clone(),
                });
                Some(id)
            }
        };
        let Some(id) = id else {
            observer.on_complete();
            return Subscription::closed();
        };

        let weak: Weak<SourceInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.state).handlers.retain(|h| h.id != id);
            }
        })
    }

    /// Feed this source into a debounce operator. Cancelling the returned
    /// subscription stops the operator and detaches it from the source.
    pub fn debounce<O>(
        &self,
        config: DebounceConfig,
        scheduler: Arc<dyn Scheduler>,
        observer: O,
    ) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        let operator = Debounce::new(config, scheduler, observer);
        let upstream = self.subscribe(operator.clone());
        Subscription::new(move || {
            operator.cancel();
            upstream.cancel();
        })
    }

    /// Feed this source into a throttle operator. Cancelling the returned
    /// subscription stops the operator and detaches it from the source.
    pub fn throttle<O>(
        &self,
        config: ThrottleConfig,
        scheduler: Arc<dyn Scheduler>,
        observer: O,
    ) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        let operator = Throttle::new(config, scheduler, observer);
        let upstream = self.subscribe(operator.clone());
        Subscription::new(move || {
            operator.cancel();
            upstream.cancel();
        })
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).handlers.len()
    }

    pub fn is_completed(&self) -> bool {
        lock(&self.inner.state).completed
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::Source;
    use crate::error::{LullError, Result};
    use crate::observer::{observer_fn, Callbacks, Observer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &'static str) -> Callbacks<u32> {
        let (values, completions) = (log.clone(), log.clone());
        Callbacks::new(move |v: u32| values.lock().unwrap().push(format!("{name} {v}")))
            .with_complete(move || {
                completions
                    .lock()
                    .unwrap()
                    .push(format!("{name} complete"))
            })
    }

    #[test]
    fn push_reaches_observers_in_registration_order() {
        let source = Source::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let log = log.clone();
            source.subscribe(observer_fn(move |v: u32| log.lock().unwrap().push((name, v))));
        }
        source.push(7).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn push_after_complete_is_stream_closed() {
        let source = Source::new();
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        source.subscribe(Callbacks::new(|_: u32| {}).with_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        source.complete();
        source.complete();
        assert!(matches!(source.push(1), Err(LullError::StreamClosed)));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let source = Source::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sub = source.subscribe(observer_fn(move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        source.push(1).unwrap();
        sub.cancel();
        sub.cancel();
        source.push(2).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn push_without_subscribers_is_ok() {
        let source: Source<u32> = Source::new();
        assert!(source.push(1).is_ok());
    }

    #[test]
    fn subscribing_to_completed_source_completes_immediately() {
        let source: Source<u32> = Source::new();
        source.complete();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let sub = source.subscribe(Callbacks::new(|_: u32| {}).with_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!sub.is_active());
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    struct Failing;

    impl Observer<u32> for Failing {
        fn on_value(&self, _value: u32) -> Result<()> {
            Err(LullError::SchedulerFailure("full".to_string()))
        }
    }

    #[test]
    fn first_error_is_returned_after_all_observers_ran() {
        let source = Source::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        source.subscribe(Failing);
        source.subscribe(observer_fn(move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let err = source.push(3).unwrap_err();
        assert!(matches!(err, LullError::SchedulerFailure(_)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn complete_waits_for_delivery_in_progress() {
        let source: Source<u32> = Source::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (entered_tx, release_rx) = (Mutex::new(entered_tx), Mutex::new(release_rx));
        let (values, completions) = (log.clone(), log.clone());
        source.subscribe(
            Callbacks::new(move |v: u32| {
                entered_tx.lock().unwrap().send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
                values.lock().unwrap().push(format!("first {v}"));
            })
            .with_complete(move || completions.lock().unwrap().push("first complete".into())),
        );
        source.subscribe(recording(&log, "second"));

        let pusher = {
            let source = source.clone();
            thread::spawn(move || source.push(7))
        };
        entered_rx.recv().unwrap();
        let completer = {
            let source = source.clone();
            thread::spawn(move || source.complete())
        };
        while !source.is_completed() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(source.push(8), Err(LullError::StreamClosed)));
        thread::sleep(Duration::from_millis(20));
        assert!(log.lock().unwrap().is_empty());

        release_tx.send(()).unwrap();
        assert!(pusher.join().unwrap().is_ok());
        completer.join().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first 7", "second 7", "first complete", "second complete"]
        );
    }

    #[test]
    fn completing_from_a_value_callback_does_not_deadlock() {
        let source: Source<u32> = Source::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (values, completions) = (log.clone(), log.clone());
        let upstream = source.clone();
        source.subscribe(
            Callbacks::new(move |v: u32| {
                values.lock().unwrap().push(format!("first {v}"));
                upstream.complete();
            })
            .with_complete(move || completions.lock().unwrap().push("first complete".into())),
        );
        source.subscribe(recording(&log, "second"));

        source.push(1).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first 1", "first complete", "second complete"]
        );
        assert!(matches!(source.push(2), Err(LullError::StreamClosed)));
    }
}
