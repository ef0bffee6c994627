use std::path::{Path, PathBuf};

use directories::BaseDirs;

use crate::error::{LullError, Result};

#[derive(Debug, Clone)]
pub struct Paths {
    config_dir: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self> {
        let base = BaseDirs::new().ok_or(LullError::NoBaseDirs)?;
        Ok(Self {
            config_dir: base.config_dir().join("lull"),
        })
    }

    /// Resolve paths under `xdg_root` instead of the user's base directories.
    pub fn new_with_override(xdg_root: Option<&Path>) -> Result<Self> {
        match xdg_root {
            Some(root) => Ok(Self {
                config_dir: root.join("config").join("lull"),
            }),
            None => Self::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}
