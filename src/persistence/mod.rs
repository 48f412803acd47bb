//! # Persistence Module
//!
//! Stores the device list and the broker settings between runs.
//!
//! The session layer never talks to the store; the application loads devices
//! at startup, builds sessions from them and writes them back (with updated
//! `last_connected_at` stamps and names) on shutdown.
//!
//! ## Error Handling Strategy
//! Uses `color_eyre` for file and format errors. A missing or unreadable broker
//! config falls back to defaults so the application always starts; a broken
//! device list is reported, since silently dropping devices would lose data on
//! the next save.

pub mod toml_store;

pub use toml_store::TomlDeviceStore;

use async_trait::async_trait;
use color_eyre::eyre::{eyre, Result};
use tracing::info;

use crate::model::Device;
use crate::mqtt::BrokerConfig;

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn load_devices(&self) -> Result<Vec<Device>>;
    async fn save_devices(&self, devices: &[Device]) -> Result<()>;

    /// Never fails; absent or unparsable settings yield the defaults
    async fn load_broker_config(&self) -> BrokerConfig;
    async fn save_broker_config(&self, config: &BrokerConfig) -> Result<()>;

    /// Inserts `device`, replacing a stored device with the same id
    async fn add_device(&self, device: Device) -> Result<()> {
        let mut devices = self.load_devices().await?;
        match devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device,
            None => {
                info!("Adding device {} ({})", device.name, device.id);
                devices.push(device);
            }
        }
        self.save_devices(&devices).await
    }

    async fn update_device(&self, device: Device) -> Result<()> {
        let mut devices = self.load_devices().await?;
        let existing = devices
            .iter_mut()
            .find(|d| d.id == device.id)
            .ok_or_else(|| eyre!("No stored device with id {}", device.id))?;
        *existing = device;
        self.save_devices(&devices).await
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let mut devices = self.load_devices().await?;
        let before = devices.len();
        devices.retain(|d| d.id != id);
        if devices.len() == before {
            return Err(eyre!("No stored device with id {}", id));
        }
        info!("Deleted device {}", id);
        self.save_devices(&devices).await
    }
}
