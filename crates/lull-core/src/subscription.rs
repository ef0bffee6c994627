use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Teardown = Box<dyn FnOnce() + Send>;

struct Inner {
    active: AtomicBool,
    teardown: Mutex<Option<Teardown>>,
}

/// Link between an observer and whatever feeds it.
///
/// Clones share state. Cancelling is idempotent; the teardown runs exactly
/// once, on the thread that first cancels. Dropping a `Subscription` does
/// not cancel it; see [`Subscription::guard`] for that.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                active: AtomicBool::new(true),
                teardown: Mutex::new(Some(Box::new(teardown))),
            }),
        }
    }

    /// A subscription that starts out cancelled.
    pub(crate) fn closed() -> Self {
        Self {
            inner: Arc::new(Inner {
                active: AtomicBool::new(false),
                teardown: Mutex::new(None),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let teardown = self
            .inner
            .teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// Cancel automatically when the returned guard is dropped.
    pub fn guard(self) -> SubscriptionGuard {
        SubscriptionGuard { subscription: self }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Debug)]
pub struct SubscriptionGuard {
    subscription: Subscription,
}

impl SubscriptionGuard {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.subscription.cancel();
    }
}
