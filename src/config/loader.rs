/// Configuration loading from bidbox.json
use crate::config::types::{BidboxError, GameConfig, Result};
use crate::config::validator::validate_config;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "bidbox.json";

impl GameConfig {
    /// Load configuration from a JSON file. Missing keys take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_content = std::fs::read_to_string(path).map_err(|e| {
            BidboxError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: GameConfig = serde_json::from_str(&config_content)
            .map_err(|e| BidboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        validate_config(&config)?;
        Ok(config)
    }

    /// Load ./bidbox.json when present, otherwise fall back to built-in defaults.
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| BidboxError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if !config_path.exists() {
            log::debug!("{} not found, using built-in defaults", DEFAULT_CONFIG_FILE);
            let config = GameConfig::default();
            validate_config(&config)?;
            return Ok(config);
        }

        Self::load_from_file(config_path)
    }
}
