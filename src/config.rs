//! On-disk bridge configuration (`config.toml`)

use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridge::BridgeOptions;
use crate::device::DeviceConfig;
use crate::discovery::DiscoverySettings;
use crate::health::HealthSettings;
use crate::mqtt::config::ConnectionConfig;

const CONFIG_DIR: &str = ".config/watts-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    pub health: HealthSettings,
    pub discovery: DiscoverySettings,
    pub devices: Vec<DeviceConfig>,
}

impl BridgeConfig {
    /// `~/.config/watts-bridge/config.toml`
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config {}: {}", path.display(), e))?;
        let config: BridgeConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !tokio::fs::try_exists(dir)
                .await
                .map_err(|e| eyre!("Failed to check if config directory exists: {}", e))?
            {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Loads `path`, writing a default config there first if it is missing.
    pub async fn ensure_default_config(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config exists: {}", e))?;
        if exists {
            let mut config = Self::load(path).await?;
            if config.migrate_devices() {
                info!("Writing migrated device capabilities to {}", path.display());
                config.save(path).await?;
            }
            return Ok(config);
        }

        info!("Creating default configuration at {}", path.display());
        let config = BridgeConfig::default();
        config.save(path).await?;
        Ok(config)
    }

    /// Brings stored device capabilities up to the current ids.
    pub fn migrate_devices(&mut self) -> bool {
        let mut changed = false;
        for device in &mut self.devices {
            changed |= device.migrate_capabilities();
        }
        changed
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            connection: self.connection.clone(),
            health: self.health.clone(),
            discovery: self.discovery.clone(),
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
