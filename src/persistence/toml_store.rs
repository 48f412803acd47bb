use async_trait::async_trait;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::DeviceStore;
use crate::config::default_config_dir;
use crate::model::Device;
use crate::mqtt::BrokerConfig;

const DEVICES_FILE: &str = "devices.toml";
const BROKER_FILE: &str = "broker.toml";

#[derive(Serialize, Deserialize, Default)]
struct DeviceFile {
    #[serde(default)]
    devices: Vec<Device>,
}

/// [`DeviceStore`] keeping one TOML file per concern in a directory
#[derive(Debug, Clone)]
pub struct TomlDeviceStore {
    dir: PathBuf,
    broker_defaults: BrokerConfig,
}

impl TomlDeviceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            broker_defaults: BrokerConfig::default(),
        }
    }

    /// Broker settings returned while no valid `broker.toml` exists
    pub fn with_broker_defaults(mut self, defaults: BrokerConfig) -> Self {
        self.broker_defaults = defaults;
        self
    }

    /// `~/.config/esplink`
    pub fn default_location() -> Self {
        Self::new(default_config_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.dir)
            .await
            .map_err(|e| eyre!("Failed to check config directory: {}", e))?
        {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
            info!("Created config directory {}", self.dir.display());
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for TomlDeviceStore {
    async fn load_devices(&self) -> Result<Vec<Device>> {
        let path = self.dir.join(DEVICES_FILE);
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check devices file: {}", e))?
        {
            debug!("No devices file at {}", path.display());
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read devices file: {}", e))?;
        let file: DeviceFile =
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse devices file: {}", e))?;

        info!("Loaded {} devices", file.devices.len());
        Ok(file.devices)
    }

    async fn save_devices(&self, devices: &[Device]) -> Result<()> {
        self.ensure_dir().await?;
        let file = DeviceFile {
            devices: devices.to_vec(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| eyre!("Failed to serialize devices: {}", e))?;

        tokio::fs::write(self.dir.join(DEVICES_FILE), content)
            .await
            .map_err(|e| eyre!("Failed to write devices file: {}", e))?;
        debug!("Saved {} devices", devices.len());
        Ok(())
    }

    async fn load_broker_config(&self) -> BrokerConfig {
        let path = self.dir.join(BROKER_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("No broker config at {} ({}), using defaults", path.display(), e);
                return self.broker_defaults.clone();
            }
        };

        toml::from_str(&content).unwrap_or_else(|e| {
            warn!("Invalid broker config, using defaults: {}", e);
            self.broker_defaults.clone()
        })
    }

    async fn save_broker_config(&self, config: &BrokerConfig) -> Result<()> {
        self.ensure_dir().await?;
        let content = toml::to_string_pretty(config)
            .map_err(|e| eyre!("Failed to serialize broker config: {}", e))?;
        tokio::fs::write(self.dir.join(BROKER_FILE), content)
            .await
            .map_err(|e| eyre!("Failed to write broker config: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CapabilityTag, ConnectionCapability};
    use chrono::Utc;

    fn store() -> (tempfile::TempDir, TomlDeviceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlDeviceStore::new(dir.path().join("esplink"));
        (dir, store)
    }

    fn lamp() -> Device {
        Device::new("Lamp", ConnectionCapability::Both)
            .with_id("lamp")
            .with_topic_prefix("home/lamp")
            .with_mac_address("AA:BB:CC:DD:EE:FF")
            .with_tags([CapabilityTag::LedControl])
    }

    #[tokio::test]
    async fn test_missing_files_yield_defaults() {
        let (_dir, store) = store();
        assert!(store.load_devices().await.unwrap().is_empty());
        assert_eq!(store.load_broker_config().await.port, 1883);
    }

    #[tokio::test]
    async fn test_devices_survive_a_save() {
        let (_dir, store) = store();
        let mut device = lamp();
        device.last_connected_at = Some(Utc::now());
        device.description = Some("desk".into());

        store.save_devices(&[device.clone()]).await.unwrap();
        let loaded = store.load_devices().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "lamp");
        assert_eq!(loaded[0].tags, device.tags);
        assert_eq!(loaded[0].topic_prefix.as_deref(), Some("home/lamp"));
        assert_eq!(
            loaded[0].last_connected_at.map(|t| t.timestamp()),
            device.last_connected_at.map(|t| t.timestamp())
        );
    }

    #[tokio::test]
    async fn test_add_is_an_upsert() {
        let (_dir, store) = store();
        store.add_device(lamp()).await.unwrap();

        let mut renamed = lamp();
        renamed.name = "Desk lamp".into();
        store.add_device(renamed).await.unwrap();

        let loaded = store.load_devices().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Desk lamp");
    }

    #[tokio::test]
    async fn test_update_and_delete_unknown_device_fail() {
        let (_dir, store) = store();
        assert!(store.update_device(lamp()).await.is_err());
        assert!(store.delete_device("lamp").await.is_err());

        store.add_device(lamp()).await.unwrap();
        store.delete_device("lamp").await.unwrap();
        assert!(store.load_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_broker_config_falls_back_to_defaults() {
        let (_dir, store) = store();
        let mut config = BrokerConfig::new("broker.lan", 8883);
        config.use_tls = true;
        store.save_broker_config(&config).await.unwrap();
        assert_eq!(store.load_broker_config().await, config);

        tokio::fs::write(store.dir().join(BROKER_FILE), "port = \"not a number\"")
            .await
            .unwrap();
        assert_eq!(store.load_broker_config().await.host, "localhost");
    }

    #[tokio::test]
    async fn test_broker_defaults_apply_until_saved() {
        let (_dir, store) = store();
        let store = store.with_broker_defaults(BrokerConfig::new("fallback.lan", 1884));
        assert_eq!(store.load_broker_config().await.host, "fallback.lan");

        store
            .save_broker_config(&BrokerConfig::new("saved.lan", 1883))
            .await
            .unwrap();
        assert_eq!(store.load_broker_config().await.host, "saved.lan");
    }

    #[tokio::test]
    async fn test_broken_device_file_is_an_error() {
        let (_dir, store) = store();
        store.save_devices(&[]).await.unwrap();
        tokio::fs::write(store.dir().join(DEVICES_FILE), "[[devices]]\nname = 3")
            .await
            .unwrap();
        assert!(store.load_devices().await.is_err());
    }
}
