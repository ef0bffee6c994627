use std::fmt;

use crate::error::Result;

/// Downstream end of a stream.
///
/// `on_complete` is delivered at most once and never before a value
/// callback that was already due. Observers may be invoked from any thread.
pub trait Observer<T>: Send + Sync {
    fn on_value(&self, value: T) -> Result<()>;

    fn on_complete(&self) {}
}

type ValueFn<T> = Box<dyn Fn(T) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// Observer assembled from plain closures.
pub struct Callbacks<T> {
    on_value: ValueFn<T>,
    on_complete: Option<CompleteFn>,
}

impl<T> Callbacks<T> {
    pub fn new<F>(on_value: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            on_value: Box::new(on_value),
            on_complete: None,
        }
    }

    pub fn with_complete<F>(mut self, on_complete: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(on_complete));
        self
    }
}

impl<T> Observer<T> for Callbacks<T> {
    fn on_value(&self, value: T) -> Result<()> {
        (self.on_value)(value);
        Ok(())
    }

    fn on_complete(&self) {
        if let Some(on_complete) = &self.on_complete {
            on_complete();
        }
    }
}

impl<T> fmt::Debug for Callbacks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_complete", &self.on_complete.is_some())
            .finish_non_exhaustive()
    }
}

pub fn observer_fn<T, F>(on_value: F) -> Callbacks<T>
where
    F: Fn(T) + Send + Sync + 'static,
{
    Callbacks::new(on_value)
}
