use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ConfigError, Result};
use crate::models::AppConfig;
use crate::validation::ConfigValidator;

/// Reads YAML configuration files.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses the file without validating it.
    pub fn load(&self) -> Result<AppConfig> {
        let contents =
            fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })?;
        let config = Self::from_yaml(&contents)?;
        info!(
            path = %self.path.display(),
            sources = config.sources.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn load_validated(&self) -> Result<AppConfig> {
        let config = self.load()?;
        ConfigValidator::new().validate(&config)?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<AppConfig> {
        Ok(serde_yaml::from_str(contents)?)
    }
}
