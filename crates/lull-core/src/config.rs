use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::debounce::DebounceConfig;
use crate::error::{LullError, Result};
use crate::throttle::ThrottleConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debounce: DebounceSection,
    #[serde(default)]
    pub throttle: ThrottleSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceSection {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSection {
    pub interval_ms: u64,
    pub emit_latest: bool,
}

impl Default for DebounceSection {
    fn default() -> Self {
        Self { interval_ms: 300 }
    }
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            emit_latest: true,
        }
    }
}

impl Config {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn debounce_config(&self) -> Result<DebounceConfig> {
        DebounceConfig::new(Duration::from_millis(self.debounce.interval_ms))
    }

    pub fn throttle_config(&self) -> Result<ThrottleConfig> {
        ThrottleConfig::new(
            Duration::from_millis(self.throttle.interval_ms),
            self.throttle.emit_latest,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.debounce.interval_ms == 0 {
            return Err(LullError::InvalidConfiguration(
                "debounce.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.throttle.interval_ms == 0 {
            return Err(LullError::InvalidConfiguration(
                "throttle.interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
