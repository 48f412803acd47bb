use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Topic marker attached to payloads that arrived over the direct link
pub const DIRECT_LINK_TOPIC: &str = "direct-link";

/// A text payload delivered by one of the transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub topic: String,
    pub payload: String,
    /// Broker delivery quality 0-2; meaningless for direct-link payloads
    pub qos: u8,
    pub received_at: DateTime<Local>,
    pub read: bool,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(10).collect();
        write!(f, "{} - {}", self.received_at.format("%H:%M:%S"), preview)
    }
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<String>, qos: u8) -> Self {
        InboundMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            qos: qos.min(2),
            received_at: Local::now(),
            read: false,
        }
    }

    pub fn from_direct_link(payload: impl Into<String>) -> Self {
        Self::from_topic(DIRECT_LINK_TOPIC, payload, 0)
    }

    pub fn is_direct_link(&self) -> bool {
        self.topic == DIRECT_LINK_TOPIC
    }

    pub fn mark_read(&mut self) {
        self.read = true;
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.received_at, self.topic, self.payload)
    }
}
