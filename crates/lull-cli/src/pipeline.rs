use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use lull_core::{
    Config, DebounceConfig, Observer, Result, Scheduler, Source, Subscription, ThrottleConfig,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OperatorKind {
    Debounce,
    Throttle,
}

/// Operator placed between the input source and the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pipeline {
    Debounce(DebounceConfig),
    Throttle(ThrottleConfig),
}

impl Pipeline {
    /// Build the operator configuration, letting command-line values win
    /// over the config file.
    pub fn resolve(
        kind: OperatorKind,
        interval_ms: Option<u64>,
        emit_latest: Option<bool>,
        config: &Config,
    ) -> Result<Self> {
        match kind {
            OperatorKind::Debounce => {
                let ms = interval_ms.unwrap_or(config.debounce.interval_ms);
                Ok(Self::Debounce(DebounceConfig::new(Duration::from_millis(ms))?))
            }
            OperatorKind::Throttle => {
                let ms = interval_ms.unwrap_or(config.throttle.interval_ms);
                let latest = emit_latest.unwrap_or(config.throttle.emit_latest);
                Ok(Self::Throttle(ThrottleConfig::new(
                    Duration::from_millis(ms),
                    latest,
                )?))
            }
        }
    }

    pub fn attach<O>(
        &self,
        source: &Source<String>,
        scheduler: Arc<dyn Scheduler>,
        observer: O,
    ) -> Subscription
    where
        O: Observer<String> + 'static,
    {
        match *self {
            Self::Debounce(config) => source.debounce(config, scheduler, observer),
            Self::Throttle(config) => source.throttle(config, scheduler, observer),
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debounce(config) => {
                write!(f, "debounce {}ms", config.interval().as_millis())
            }
            Self::Throttle(config) => write!(
                f,
                "throttle {}ms ({})",
                config.interval().as_millis(),
                if config.emit_latest() {
                    "latest"
                } else {
                    "leading"
                }
            ),
        }
    }
}
