//! Configuration management for the wildmap CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use wildmap::{AddressModel, AnalysisConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Symbol file used when `--symbols` is not given
    pub symbols: Option<PathBuf>,
    pub page_size: u64,
    pub word_size: usize,
    pub granularity: u64,
    pub allocators: Vec<String>,
    pub address_model: AddressModel,
}

impl Default for Config {
    fn default() -> Self {
        let analysis = AnalysisConfig::default();
        Self {
            symbols: None,
            page_size: analysis.page_size,
            word_size: analysis.word_size,
            granularity: analysis.granularity,
            allocators: analysis.allocators,
            address_model: analysis.address_model,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("wildmap");

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory at {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }

    /// Settings handed to the analysis library
    pub fn analysis(&self) -> AnalysisConfig {
        AnalysisConfig {
            page_size: self.page_size,
            word_size: self.word_size,
            granularity: self.granularity,
            address_model: self.address_model,
            allocators: self.allocators.clone(),
            ..AnalysisConfig::default()
        }
    }
}
