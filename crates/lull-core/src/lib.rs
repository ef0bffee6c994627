pub mod config;
pub mod debounce;
pub mod error;
mod exclusive;
pub mod observer;
pub mod paths;
pub mod scheduler;
pub mod source;
pub mod subscription;
pub mod thread_scheduler;
pub mod throttle;
pub mod virtual_time;

pub use config::Config;
pub use debounce::{Debounce, DebounceConfig};
pub use error::{LullError, Result};
pub use observer::{observer_fn, Callbacks, Observer};
pub use paths::Paths;
pub use scheduler::{Scheduler, TimerHandle, TimerTask};
pub use source::Source;
pub use subscription::{Subscription, SubscriptionGuard};
pub use thread_scheduler::ThreadScheduler;
pub use throttle::{Throttle, ThrottleConfig};
pub use virtual_time::VirtualScheduler;
