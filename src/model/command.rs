//! Commands sent to a device and the closed set of command kinds

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use super::CapabilityTag;
use crate::codec::CodecError;

/// Action requested from a device; the serde name is the wire tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    // LED
    LedOn,
    LedOff,
    LedBlink,
    LedSetBrightness,

    // Sensors
    ReadTemperature,
    ReadHumidity,
    ReadDistance,

    // Motor
    MotorStart,
    MotorStop,
    MotorSetSpeed,

    // GPIO
    GpioSetHigh,
    GpioSetLow,
    GpioRead,

    Custom,
}

impl CommandKind {
    pub const ALL: [CommandKind; 14] = [
        CommandKind::LedOn,
        CommandKind::LedOff,
        CommandKind::LedBlink,
        CommandKind::LedSetBrightness,
        CommandKind::ReadTemperature,
        CommandKind::ReadHumidity,
        CommandKind::ReadDistance,
        CommandKind::MotorStart,
        CommandKind::MotorStop,
        CommandKind::MotorSetSpeed,
        CommandKind::GpioSetHigh,
        CommandKind::GpioSetLow,
        CommandKind::GpioRead,
        CommandKind::Custom,
    ];

    /// Wire tag used in the `type` field of the envelope
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LedOn => "led_on",
            Self::LedOff => "led_off",
            Self::LedBlink => "led_blink",
            Self::LedSetBrightness => "led_set_brightness",
            Self::ReadTemperature => "read_temperature",
            Self::ReadHumidity => "read_humidity",
            Self::ReadDistance => "read_distance",
            Self::MotorStart => "motor_start",
            Self::MotorStop => "motor_stop",
            Self::MotorSetSpeed => "motor_set_speed",
            Self::GpioSetHigh => "gpio_set_high",
            Self::GpioSetLow => "gpio_set_low",
            Self::GpioRead => "gpio_read",
            Self::Custom => "custom",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::LedOn => "LED on",
            Self::LedOff => "LED off",
            Self::LedBlink => "LED blink",
            Self::LedSetBrightness => "Set LED brightness",
            Self::ReadTemperature => "Read temperature",
            Self::ReadHumidity => "Read humidity",
            Self::ReadDistance => "Read distance",
            Self::MotorStart => "Start motor",
            Self::MotorStop => "Stop motor",
            Self::MotorSetSpeed => "Set motor speed",
            Self::GpioSetHigh => "GPIO high",
            Self::GpioSetLow => "GPIO low",
            Self::GpioRead => "Read GPIO",
            Self::Custom => "Custom command",
        }
    }

    /// Capability tag a device needs for this command to be offered
    ///
    /// `Custom` needs none and is always offered.
    pub fn required_tag(self) -> Option<CapabilityTag> {
        match self {
            Self::LedOn | Self::LedOff | Self::LedBlink | Self::LedSetBrightness => {
                Some(CapabilityTag::LedControl)
            }
            Self::ReadTemperature | Self::ReadHumidity | Self::ReadDistance => {
                Some(CapabilityTag::SensorReading)
            }
            Self::MotorStart | Self::MotorStop | Self::MotorSetSpeed => {
                Some(CapabilityTag::MotorControl)
            }
            Self::GpioSetHigh | Self::GpioSetLow | Self::GpioRead => {
                Some(CapabilityTag::GpioControl)
            }
            Self::Custom => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single command instance addressed to one device
///
/// The id never changes after creation. `sent` and `has_response` only move
/// from `false` to `true`; there are no setters that reverse them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    id: String,
    kind: CommandKind,
    parameters: Map<String, Value>,
    device_id: String,
    created_at: DateTime<Utc>,
    sent: bool,
    has_response: bool,
    response: Option<String>,
}

impl Command {
    pub fn new(kind: CommandKind, device_id: impl Into<String>) -> Self {
        Self::from_parts(
            Uuid::new_v4().to_string(),
            kind,
            Map::new(),
            device_id.into(),
            Utc::now(),
        )
    }

    /// Rebuilds a command from decoded envelope fields
    pub fn from_parts(
        id: String,
        kind: CommandKind,
        parameters: Map<String, Value>,
        device_id: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            parameters,
            device_id,
            created_at,
            sent: false,
            has_response: false,
            response: None,
        }
    }

    /// Sets a parameter, replacing any previous value under the same key
    ///
    /// Fails with [`CodecError::Encoding`] if `value` has no JSON form, e.g. a
    /// map keyed by something other than strings.
    pub fn set_parameter<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), CodecError> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .map_err(|e| CodecError::Encoding(format!("parameter '{key}': {e}")))?;
        self.parameters.insert(key, value);
        Ok(())
    }

    pub fn with_parameter<T: Serialize>(
        mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<Self, CodecError> {
        self.set_parameter(key, value)?;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn has_response(&self) -> bool {
        self.has_response
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub(crate) fn mark_sent(&mut self) {
        self.sent = true;
    }

    pub(crate) fn record_response(&mut self, payload: String) {
        self.has_response = true;
        self.response = Some(payload);
    }
}
