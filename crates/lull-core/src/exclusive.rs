use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::{LullError, Result};

/// Operator state plus an `active` flag kept outside the mutex, so `cancel`
/// can flip it before waiting for the lock. The holder's thread is tracked
/// so calls from inside a downstream callback fail instead of deadlocking.
pub(crate) struct Exclusive<S> {
    state: Mutex<S>,
    active: AtomicBool,
    holder: Mutex<Option<ThreadId>>,
}

impl<S> Exclusive<S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            active: AtomicBool::new(true),
            holder: Mutex::new(None),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark terminal. Returns whether this call did the transition.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn held_by_current_thread(&self) -> bool {
        *lock(&self.holder) == Some(thread::current().id())
    }

    pub(crate) fn enter(&self) -> Result<Entered<'_, S>> {
        if self.held_by_current_thread() {
            return Err(LullError::ReentrantCall);
        }
        let guard = lock(&self.state);
        *lock(&self.holder) = Some(thread::current().id());
        Ok(Entered {
            guard,
            holder: &self.holder,
        })
    }
}

pub(crate) struct Entered<'a, S> {
    guard: MutexGuard<'a, S>,
    holder: &'a Mutex<Option<ThreadId>>,
}

impl<S> Deref for Entered<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.guard
    }
}

impl<S> DerefMut for Entered<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.guard
    }
}

impl<S> Drop for Entered<'_, S> {
    fn drop(&mut self) {
        *lock(self.holder) = None;
    }
}

// Poison from a panicking downstream callback is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
