use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{GattProfile, DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID};
use crate::mqtt::BrokerConfig;
use crate::session::{SessionSettings, DEFAULT_HISTORY_CAPACITY, DEFAULT_PENDING_CAPACITY};

const CONFIG_DIR: &str = ".config/esplink";
const CONFIG_FILE: &str = "esplink.toml";

/// Application settings read from `~/.config/esplink/esplink.toml`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the device and broker files; defaults to the config directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub broker: BrokerConfig,
    pub timing: TimingConfig,
    pub session: SessionLimits,
    pub gatt: GattDefaults,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub connect_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            reconnect_interval_secs: 5,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionLimits {
    pub history_capacity: usize,
    pub pending_capacity: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

impl From<&SessionLimits> for SessionSettings {
    fn from(limits: &SessionLimits) -> Self {
        SessionSettings {
            history_capacity: limits.history_capacity,
            pending_capacity: limits.pending_capacity,
        }
    }
}

/// GATT identifiers used for scanning and for devices without overrides
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct GattDefaults {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

impl Default for GattDefaults {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
        }
    }
}

impl From<&GattDefaults> for GattProfile {
    fn from(gatt: &GattDefaults) -> Self {
        GattProfile {
            service: gatt.service_uuid,
            characteristic: gatt.characteristic_uuid,
        }
    }
}

impl AppConfig {
    /// Loads the config from the default location
    pub async fn load_default() -> Result<Self> {
        Self::load(&default_config_dir().join(CONFIG_FILE)).await
    }

    /// Missing file yields defaults, a malformed one is an error
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file: {}", e))?
        {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file: {}", e))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse config file: {}", e))?;

        config
            .broker
            .validate()
            .map_err(|e| eyre!("Invalid broker section in {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_config_dir)
    }

    pub fn session_settings(&self) -> SessionSettings {
        (&self.session).into()
    }

    pub fn gatt_profile(&self) -> GattProfile {
        (&self.gatt).into()
    }
}

/// `~/.config/esplink`, or `./.config/esplink` without a home directory
pub fn default_config_dir() -> PathBuf {
    let mut dir = get_home_dir();
    dir.push(CONFIG_DIR);
    dir
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
