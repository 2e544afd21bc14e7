pub mod session_config;

use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::session_config::SessionConfig;

pub const CONFIG_FILE_NAME: &str = "ipowerup_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    /// One of error, warn, info, debug, trace
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            session: SessionConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads the config from `config_dir`, falling back to defaults when the file is missing.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config into `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        if let Err(e) = fs::create_dir_all(config_dir).await {
            error!("Failed to create config directory {:?}: {}", config_dir, e);
            return Err(e.into());
        }

        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;

        info!("Config saved to {:?}.", file_path_str);
        Ok(())
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        crate::logging::parse_level(&self.log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::power_bank::TemperatureUnit;
    use std::time::Duration;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ipowerup-config-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let config = AppConfig::load_config(&scratch_dir("missing")).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.session.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.session.handshake_settle(), Duration::from_secs(1));
        assert!(config.session.auto_connect);
    }

    #[tokio::test]
    async fn saved_config_is_loaded_back() {
        let dir = scratch_dir("saved");
        let mut config = AppConfig::default();
        config.session.temperature_unit = TemperatureUnit::Fahrenheit;
        config.session.verification_timeout_ms = 0;
        config.log_level = "debug".to_string();

        config.save_config(&dir).await.unwrap();
        let loaded = AppConfig::load_config(&dir).await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.session.verification_timeout(), None);
        assert_eq!(loaded.log_level_filter(), log::LevelFilter::Debug);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"session": {"auto_connect": false, "temperature_unit": "fahrenheit"}}"#).unwrap();
        assert!(!config.session.auto_connect);
        assert_eq!(config.session.temperature_unit, TemperatureUnit::Fahrenheit);
        assert_eq!(config.session.poll_interval_ms, 5000);
        assert_eq!(config.log_level, "info");
    }
}
