use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// rumqttc refuses keep-alive intervals below this
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Connection parameters for one broker client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Must be unique among concurrent connections to the same broker
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_id: format!("esplink_{}", Uuid::new_v4().simple()),
            username: None,
            password: None,
            use_tls: false,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.trim().is_empty() {
            return Err(TransportError::InvalidConfiguration(
                "broker host is empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(TransportError::InvalidConfiguration(
                "broker port must be greater than 0".to_string(),
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(TransportError::InvalidConfiguration(
                "client id is empty".to_string(),
            ));
        }
        if self.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(TransportError::InvalidConfiguration(format!(
                "keep-alive must be at least {MIN_KEEP_ALIVE_SECS}s, got {}s",
                self.keep_alive_secs
            )));
        }
        Ok(())
    }

    /// Username/password pair, if a username is configured
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username.as_ref().map(|user| {
            (
                user.clone(),
                self.password.clone().unwrap_or_default(),
            )
        })
    }

    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}
