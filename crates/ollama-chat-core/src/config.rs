use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ai::ollama::DEFAULT_BASE_URL;
use crate::error::{ChatError, Result};
use crate::state::DEFAULT_TEMPERATURE;

/// Overrides `base_url` when set.
pub const BASE_URL_ENV: &str = "OLLAMA_BASE_URL";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub default_model: Option<String>,
    pub temperature: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl Config {
    /// Read the user's config file (defaults if absent), then apply the
    /// environment override.
    pub fn load() -> Result<Self> {
        let config = Self::load_from(&Self::get_config_path()?)?;
        Ok(config.with_base_url_override(std::env::var(BASE_URL_ENV).ok()))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let config_content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_content).map_err(|e| ChatError::Config {
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(config)
    }

    pub fn with_base_url_override(mut self, base_url: Option<String>) -> Self {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        self
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| ChatError::Config {
            reason: "could not determine config directory".to_string(),
        })?;

        Ok(config_dir.join("ollama-chat").join("config.json"))
    }
}
