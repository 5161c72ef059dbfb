//! Configuration loading and parsing

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CanConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
        }
    }
}

fn default_interface() -> String {
    "can0".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("telemetry.db")
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [can]
            interface = "can1"

            [storage]
            database = "/var/lib/telemetry/records.db"
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.can.interface, "can1");
        assert_eq!(
            config.storage.database,
            PathBuf::from("/var/lib/telemetry/records.db")
        );
    }

    #[test]
    fn test_config_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.can.interface, "can0");
        assert_eq!(config.storage.database, PathBuf::from("telemetry.db"));
    }
}
